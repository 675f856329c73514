//! # opensensor-core
//!
//! **Live CPU telemetry straight from the registers.**
//!
//! `opensensor-core` reads clocks, voltages, temperatures and power from
//! model-specific registers, PCI configuration space and the AMD System
//! Management Unit, and keeps per-core and per-package sensor values fresh on
//! every [`Processor::update`].
//!
//! ## Quick Start
//!
//! ```no_run
//! # #[cfg(target_os = "linux")]
//! # fn main() {
//! use std::sync::Arc;
//!
//! use opensensor_core::{
//!     EngineConfig, HardwareId, LinuxDriver, OsAffinity, Package, Processor, RegisterBus, Vendor,
//! };
//!
//! // Records normally come from /proc/cpuinfo or CPUID enumeration.
//! let records = (0..8).map(|cpu| {
//!     HardwareId::new(Vendor::Amd, 0x17, 0x71, cpu).with_ids(0, (cpu / 2) as u32)
//! });
//! let package = Package::from_records(records).unwrap();
//!
//! let bus = Arc::new(RegisterBus::new(Arc::new(LinuxDriver::new())));
//! let mut cpu = Processor::new(package, bus, Arc::new(OsAffinity), EngineConfig::default());
//!
//! let report = cpu.update();
//! println!("{} cores read, {} skipped", report.cores_read, report.cores_skipped);
//! for sensor in cpu.sensors().iter() {
//!     println!("{sensor}");
//! }
//! # }
//! # #[cfg(not(target_os = "linux"))]
//! # fn main() {}
//! ```
//!
//! ## Architecture
//!
//! Driver → RegisterBus (timed lock) → Processor (topology walk) → SensorSet
//!
//! - MSR reads run inside an [`AffinityScope`] bound to one logical CPU.
//! - PCI, SMN and I/O port access is serialized by one bus lock with a
//!   bounded wait; contention means "no value this cycle", never a stall.
//! - The SMU mailbox is one generic transaction over per-family addresses.
//! - Failed reads keep the previous value; sensors go stale, not missing.
//!
//! Everything hardware-facing sits behind [`RegisterDriver`] and
//! [`AffinityController`], and [`mock::MockMachine`] implements both for
//! tests.

pub mod affinity;
pub mod bus;
pub mod calibration;
pub mod config;
pub mod driver;
pub mod energy;
pub mod error;
pub mod mailbox;
pub mod mock;
pub mod processor;
pub mod profile;
pub mod sensor;
pub mod topology;

#[cfg(target_os = "linux")]
pub use affinity::OsAffinity;
pub use affinity::{Affinity, AffinityController, AffinityScope, CpuSet};
pub use bus::{BusGuard, DEFAULT_BUS_TIMEOUT, RegisterBus, SmnPort};
pub use calibration::{CalibrationConfig, CycleClock, FrequencyCalibrator, SystemClock, TscEstimate};
pub use config::{EngineConfig, PmTableLayout, PmTableSensor};
#[cfg(target_os = "linux")]
pub use driver::LinuxDriver;
pub use driver::{MsrValue, PciAddress, RegisterDriver};
pub use energy::{EnergyAccumulator, EnergySample, energy_delta};
pub use error::{Error, Result};
pub use mailbox::{
    DEFAULT_SMU_RETRIES, MailboxClient, PmTableCommands, SmuAddresses, SmuLayout, SmuStatus,
    SmuVersion,
};
pub use processor::{MailboxOutcome, Processor, UpdateReport};
pub use profile::{BusClockSource, CodeName, FamilyProfile, Strategy};
pub use sensor::{Sensor, SensorKind, SensorSet, SensorSnapshot};
pub use topology::{Core, CoreReadings, CpuFeatures, CpuidLeaf, HardwareId, Node, Package, Thread, Vendor};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
