//! Published sensor values.
//!
//! Sensors are created the first time a value is published for them and are
//! never removed. Publishing `None` for an existing sensor keeps its previous
//! value, so a transient read failure shows up as a stale reading rather than
//! a missing one.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Semantic type of a sensor value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    /// MHz
    Clock,
    /// V
    Voltage,
    /// A
    Current,
    /// °C
    Temperature,
    /// W
    Power,
    /// %
    Load,
    /// Dimensionless ratio
    Factor,
}

impl SensorKind {
    pub fn unit(self) -> &'static str {
        match self {
            Self::Clock => "MHz",
            Self::Voltage => "V",
            Self::Current => "A",
            Self::Temperature => "°C",
            Self::Power => "W",
            Self::Load => "%",
            Self::Factor => "",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clock => write!(f, "clock"),
            Self::Voltage => write!(f, "voltage"),
            Self::Current => write!(f, "current"),
            Self::Temperature => write!(f, "temperature"),
            Self::Power => write!(f, "power"),
            Self::Load => write!(f, "load"),
            Self::Factor => write!(f, "factor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    /// Stable identifier, e.g. `/cpu/0/temperature/2`.
    pub identifier: String,
    pub name: String,
    pub kind: SensorKind,
    pub index: usize,
    pub value: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Sensor {
    fn record(&mut self, value: f64) {
        self.value = Some(value);
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(v) => write!(f, "{:<24} {:>10.3} {}", self.name, v, self.kind.unit()),
            None => write!(f, "{:<24} {:>10}", self.name, "-"),
        }
    }
}

/// Ordered set of sensors for one package.
#[derive(Debug, Clone, Default)]
pub struct SensorSet {
    prefix: String,
    sensors: Vec<Sensor>,
    by_identifier: HashMap<String, usize>,
    renames: BTreeMap<String, String>,
}

impl SensorSet {
    /// `prefix` roots every identifier, e.g. `/amdcpu/0`.
    pub fn new(prefix: impl Into<String>, renames: BTreeMap<String, String>) -> Self {
        Self {
            prefix: prefix.into(),
            renames,
            ..Self::default()
        }
    }

    /// Record `value` for the sensor (`kind`, `index`), creating it on first
    /// publish. Non-finite values are treated like `None`.
    pub fn publish(&mut self, kind: SensorKind, index: usize, name: &str, value: Option<f64>) {
        let value = value.filter(|v| v.is_finite());
        let identifier = format!("{}/{kind}/{index}", self.prefix);
        let pos = match self.by_identifier.get(&identifier) {
            Some(&pos) => pos,
            None => {
                if value.is_none() {
                    return;
                }
                let name = self
                    .renames
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| name.to_string());
                self.sensors.push(Sensor {
                    identifier: identifier.clone(),
                    name,
                    kind,
                    index,
                    value: None,
                    min: None,
                    max: None,
                });
                self.by_identifier.insert(identifier, self.sensors.len() - 1);
                self.sensors.len() - 1
            }
        };
        if let Some(v) = value {
            self.sensors[pos].record(v);
        }
    }

    pub fn get(&self, kind: SensorKind, index: usize) -> Option<&Sensor> {
        let identifier = format!("{}/{kind}/{index}", self.prefix);
        self.by_identifier.get(&identifier).map(|&i| &self.sensors[i])
    }

    pub fn find(&self, kind: SensorKind, name: &str) -> Option<&Sensor> {
        self.sensors
            .iter()
            .find(|s| s.kind == kind && s.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.iter()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

/// Point-in-time copy of one package's sensors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub collected_unix_ms: u64,
    pub package: String,
    pub vendor: String,
    pub code_name: String,
    pub tsc_frequency_mhz: Option<f64>,
    pub smu_version: Option<String>,
    pub sensors: Vec<Sensor>,
}

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_tracks_min_max() {
        let mut set = SensorSet::new("/cpu/0", BTreeMap::new());
        for v in [50.0, 42.0, 61.5, 55.0] {
            set.publish(SensorKind::Temperature, 0, "Core #1", Some(v));
        }
        let s = set.get(SensorKind::Temperature, 0).unwrap();
        assert_eq!(s.value, Some(55.0));
        assert_eq!(s.min, Some(42.0));
        assert_eq!(s.max, Some(61.5));
        assert_eq!(s.identifier, "/cpu/0/temperature/0");
    }

    #[test]
    fn missing_value_keeps_stale_reading() {
        let mut set = SensorSet::new("/cpu/0", BTreeMap::new());
        set.publish(SensorKind::Clock, 1, "Core #2", Some(3600.0));
        set.publish(SensorKind::Clock, 1, "Core #2", None);
        set.publish(SensorKind::Clock, 1, "Core #2", Some(f64::NAN));
        assert_eq!(set.get(SensorKind::Clock, 1).unwrap().value, Some(3600.0));
    }

    #[test]
    fn never_read_sensor_is_not_created() {
        let mut set = SensorSet::new("/cpu/0", BTreeMap::new());
        set.publish(SensorKind::Power, 0, "Package", None);
        assert!(set.is_empty());
    }

    #[test]
    fn renames_apply_on_creation() {
        let renames = BTreeMap::from([("Core #1".to_string(), "P-core 0".to_string())]);
        let mut set = SensorSet::new("/cpu/0", renames);
        set.publish(SensorKind::Clock, 0, "Core #1", Some(4000.0));
        assert!(set.find(SensorKind::Clock, "P-core 0").is_some());
        assert!(set.find(SensorKind::Clock, "Core #1").is_none());
    }

    #[test]
    fn snapshot_serializes_kinds_in_snake_case() {
        let mut set = SensorSet::new("/cpu/0", BTreeMap::new());
        set.publish(SensorKind::Temperature, 0, "Core Max", Some(70.0));
        let snapshot = SensorSnapshot {
            collected_unix_ms: unix_ms_now(),
            package: "Test CPU".into(),
            vendor: "AMD".into(),
            code_name: "Matisse".into(),
            tsc_frequency_mhz: Some(3800.0),
            smu_version: None,
            sensors: set.iter().cloned().collect(),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"kind\":\"temperature\""));
        let back: SensorSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sensors, snapshot.sensors);
    }
}
