//! Error taxonomy for register access, affinity binding and the SMU mailbox.
//!
//! Three classes of failure flow through the engine:
//!
//! - **Transient**: bus lock timeout, offline logical CPU, busy mailbox.
//!   The affected reading is skipped for one cycle and the cached value stays.
//! - **Permanent**: missing capability or unknown hardware family. Recorded
//!   once at construction and surfaced as "not supported".
//! - **Numeric anomalies** are not errors at all: derived values come back as
//!   `None` and the sensor is suppressed for that cycle.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::affinity::Affinity;
use crate::driver::PciAddress;
use crate::mailbox::SmuStatus;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the acquisition engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("register bus busy: lock not acquired within {timeout:?}")]
    BusBusy { timeout: Duration },

    #[error("failed to read MSR 0x{index:X}: {source}")]
    Msr { index: u32, source: io::Error },

    #[error("failed to access PCI config {address} register 0x{register:02X}: {source}")]
    Pci {
        address: PciAddress,
        register: u32,
        source: io::Error,
    },

    #[error("failed to access I/O port 0x{port:04X}: {source}")]
    IoPort { port: u16, source: io::Error },

    #[error("failed to read physical memory at 0x{address:X}: {source}")]
    PhysicalMemory { address: u64, source: io::Error },

    #[error("failed to bind to {target}: {source}")]
    Affinity { target: Affinity, source: io::Error },

    #[error("failed to restore thread affinity: {source}")]
    AffinityRestore { source: io::Error },

    #[error("an affinity scope is already open on this thread")]
    NestedAffinityScope,

    #[error("SMU mailbox busy after {polls} polls")]
    MailboxBusy { polls: u32 },

    #[error("SMU did not answer command 0x{opcode:02X} within {polls} polls")]
    MailboxTimeout { opcode: u32, polls: u32 },

    #[error("SMU rejected command 0x{opcode:02X}: {status}")]
    MailboxStatus { opcode: u32, status: SmuStatus },

    #[error("{0} is not supported on this processor")]
    Unsupported(&'static str),

    #[error("failed to read config {path}: {source}")]
    ConfigIo { path: PathBuf, source: io::Error },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl Error {
    /// Whether the failure is expected to clear on a later cycle.
    ///
    /// Transient errors leave the previous cached value in place; everything
    /// else is either a permanent capability gap or a host setup problem.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BusBusy { .. }
                | Self::Msr { .. }
                | Self::Pci { .. }
                | Self::IoPort { .. }
                | Self::PhysicalMemory { .. }
                | Self::Affinity { .. }
                | Self::AffinityRestore { .. }
                | Self::MailboxBusy { .. }
                | Self::MailboxTimeout { .. }
                | Self::MailboxStatus { .. }
        )
    }
}
