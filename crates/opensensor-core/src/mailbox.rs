//! SMU mailbox protocol.
//!
//! The System Management Unit exposes three register groups in SMN space:
//! a command register, a response register and six argument registers. A
//! transaction runs entirely under the bus lock:
//!
//! 1. take the bus lock (bounded wait)
//! 2. poll the response register until it is non-zero (mailbox idle)
//! 3. clear the response register
//! 4. write the argument words
//! 5. write the opcode, which starts the firmware
//! 6. poll the response register again
//! 7. check the status code
//! 8. read the argument registers back as the result
//!
//! The lock is held by a [`BusGuard`] and released on every exit path.
//! Addresses differ per processor generation and come from
//! [`profile`](crate::profile); the algorithm here is shared.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bus::{BusGuard, RegisterBus, SmnPort};
use crate::error::{Error, Result};

/// Number of argument/result words per transaction.
pub const SMU_MAX_ARGS: usize = 6;

/// Default number of response-register polls per wait.
pub const DEFAULT_SMU_RETRIES: u32 = 8096;

/// Opcode that returns the firmware version in the first result word.
pub const SMU_CMD_GET_VERSION: u32 = 0x02;

/// Response register status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmuStatus {
    Ok,
    Failed,
    UnknownCommand,
    RejectedPrerequisite,
    RejectedBusy,
    Other(u32),
}

impl SmuStatus {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0x01 => Self::Ok,
            0xFF => Self::Failed,
            0xFE => Self::UnknownCommand,
            0xFD => Self::RejectedPrerequisite,
            0xFC => Self::RejectedBusy,
            other => Self::Other(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Ok => 0x01,
            Self::Failed => 0xFF,
            Self::UnknownCommand => 0xFE,
            Self::RejectedPrerequisite => 0xFD,
            Self::RejectedBusy => 0xFC,
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for SmuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Failed => write!(f, "failed"),
            Self::UnknownCommand => write!(f, "unknown command"),
            Self::RejectedPrerequisite => write!(f, "rejected: prerequisite not met"),
            Self::RejectedBusy => write!(f, "rejected: busy"),
            Self::Other(raw) => write!(f, "status 0x{raw:02X}"),
        }
    }
}

/// SMN addresses of one mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmuAddresses {
    pub port: SmnPort,
    pub command: u32,
    pub response: u32,
    /// First argument register; the rest follow at `arg_stride`.
    pub args: u32,
    pub arg_stride: u32,
}

impl SmuAddresses {
    pub fn arg(&self, i: usize) -> u32 {
        self.args + self.arg_stride * i as u32
    }
}

/// Opcodes for the power-management table, where the firmware supports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmTableCommands {
    pub get_version: u32,
    pub transfer_to_dram: u32,
    pub get_dram_address: u32,
    /// First argument word for transfer/address commands (APUs select the table with 3).
    pub table_selector: u32,
}

/// Everything needed to talk to one processor generation's SMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmuLayout {
    pub mailbox: SmuAddresses,
    pub pm_table: Option<PmTableCommands>,
}

/// Firmware version as reported by [`SMU_CMD_GET_VERSION`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmuVersion(pub u32);

impl fmt::Display for SmuVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(f, "{}.{}.{}", (v >> 16) & 0xFF, (v >> 8) & 0xFF, v & 0xFF)
    }
}

pub struct MailboxClient {
    bus: Arc<RegisterBus>,
    layout: SmuLayout,
    retries: u32,
}

impl MailboxClient {
    pub fn new(bus: Arc<RegisterBus>, layout: SmuLayout, retries: u32) -> Self {
        Self {
            bus,
            layout,
            retries,
        }
    }

    pub fn layout(&self) -> &SmuLayout {
        &self.layout
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Run one request/response transaction. Missing argument words are zero.
    pub fn transaction(&self, opcode: u32, args: &[u32]) -> Result<[u32; SMU_MAX_ARGS]> {
        let mb = self.layout.mailbox;
        let mut words = [0u32; SMU_MAX_ARGS];
        for (slot, &arg) in words.iter_mut().zip(args) {
            *slot = arg;
        }

        let guard = self.bus.lock()?;

        if self.poll_response(&guard)?.is_none() {
            return Err(Error::MailboxBusy {
                polls: self.retries,
            });
        }

        guard.write_smn(mb.port, mb.response, 0)?;
        for (i, &word) in words.iter().enumerate() {
            guard.write_smn(mb.port, mb.arg(i), word)?;
        }
        guard.write_smn(mb.port, mb.command, opcode)?;

        let Some(raw) = self.poll_response(&guard)? else {
            return Err(Error::MailboxTimeout {
                opcode,
                polls: self.retries,
            });
        };
        let status = SmuStatus::from_raw(raw);
        if status != SmuStatus::Ok {
            return Err(Error::MailboxStatus { opcode, status });
        }

        let mut results = [0u32; SMU_MAX_ARGS];
        for (i, slot) in results.iter_mut().enumerate() {
            *slot = guard.read_smn(mb.port, mb.arg(i))?;
        }
        Ok(results)
    }

    /// Poll the response register up to the retry budget. `None` if it stayed zero.
    fn poll_response(&self, guard: &BusGuard<'_>) -> Result<Option<u32>> {
        let mb = self.layout.mailbox;
        for _ in 0..self.retries {
            let value = guard.read_smn(mb.port, mb.response)?;
            if value != 0 {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    pub fn version(&self) -> Result<SmuVersion> {
        let out = self.transaction(SMU_CMD_GET_VERSION, &[])?;
        Ok(SmuVersion(out[0]))
    }

    fn pm_commands(&self) -> Result<PmTableCommands> {
        self.layout
            .pm_table
            .ok_or(Error::Unsupported("SMU power-management table"))
    }

    pub fn pm_table_version(&self) -> Result<u32> {
        let cmds = self.pm_commands()?;
        Ok(self.transaction(cmds.get_version, &[])?[0])
    }

    /// Ask the firmware to refresh the table copy in DRAM.
    pub fn transfer_pm_table(&self) -> Result<()> {
        let cmds = self.pm_commands()?;
        self.transaction(cmds.transfer_to_dram, &[cmds.table_selector])?;
        Ok(())
    }

    /// Physical address of the DRAM copy of the table.
    pub fn pm_table_address(&self) -> Result<u64> {
        let cmds = self.pm_commands()?;
        let out = self.transaction(cmds.get_dram_address, &[cmds.table_selector])?;
        Ok(u64::from(out[0]) | (u64::from(out[1]) << 32))
    }

    /// Refresh the table and read `entries` little-endian `f32` values from
    /// `address`.
    pub fn read_pm_table(&self, address: u64, entries: usize) -> Result<Vec<f32>> {
        self.transfer_pm_table()?;
        let mut raw = vec![0u8; entries * 4];
        self.bus.read_physical_memory(address, &mut raw)?;
        Ok(raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }
}
