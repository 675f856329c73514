//! Engine configuration.
//!
//! Everything here has a working default; a JSON file only needs the fields
//! it changes. Per-model data that the engine cannot know on its own (PM
//! table layouts, display names) also arrives through this struct.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_BUS_TIMEOUT;
use crate::calibration::CalibrationConfig;
use crate::error::{Error, Result};
use crate::mailbox::DEFAULT_SMU_RETRIES;
use crate::sensor::SensorKind;

/// One value inside an SMU power-management table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmTableSensor {
    /// Byte offset of the `f32` in the table.
    pub offset: usize,
    pub name: String,
    pub kind: SensorKind,
    #[serde(default = "unit_scale")]
    pub scale: f64,
}

fn unit_scale() -> f64 {
    1.0
}

/// Layout of one PM table version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmTableLayout {
    pub version: u32,
    /// Table size in bytes.
    pub size: usize,
    pub sensors: Vec<PmTableSensor>,
}

impl PmTableLayout {
    /// Number of `f32` entries to read.
    pub fn entries(&self) -> usize {
        let highest = self.sensors.iter().map(|s| s.offset / 4 + 1).max().unwrap_or(0);
        (self.size / 4).max(highest)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bounded wait for the register bus lock.
    pub bus_timeout_ms: u64,
    /// Response polls per SMU mailbox wait.
    pub smu_retries: u32,
    pub calibration: CalibrationConfig,
    pub pm_tables: Vec<PmTableLayout>,
    /// Display-name overrides, keyed by default sensor name.
    pub renames: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bus_timeout_ms: DEFAULT_BUS_TIMEOUT.as_millis() as u64,
            smu_retries: DEFAULT_SMU_RETRIES,
            calibration: CalibrationConfig::default(),
            pm_tables: Vec::new(),
            renames: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| Error::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn bus_timeout(&self) -> Duration {
        Duration::from_millis(self.bus_timeout_ms)
    }

    pub fn pm_table_layout(&self, version: u32) -> Option<&PmTableLayout> {
        self.pm_tables.iter().find(|t| t.version == version)
    }
}
