//! The privileged register boundary.
//!
//! A [`RegisterDriver`] performs single MSR, PCI configuration space, I/O port
//! and physical memory operations. Each call is assumed to be atomic on its
//! own, but drivers give no mutual exclusion between callers; that is the
//! job of [`RegisterBus`](crate::bus::RegisterBus).
//!
//! MSR reads execute on whichever logical CPU the calling thread currently
//! runs on. Callers bind the thread first with an
//! [`AffinityScope`](crate::affinity::AffinityScope).

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

/// PCI bus/device/function address (segment 0 unless stated otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PciAddress {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            segment: 0,
            bus,
            device,
            function,
        }
    }

    /// Host bridge on bus 0, device 0, function 0.
    pub const HOST_BRIDGE: Self = Self::new(0, 0, 0);
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

/// A 64-bit MSR value as returned by `rdmsr` (EDX:EAX).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsrValue {
    pub low: u32,
    pub high: u32,
}

impl MsrValue {
    pub const fn new(low: u32, high: u32) -> Self {
        Self { low, high }
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self {
            low: bits as u32,
            high: (bits >> 32) as u32,
        }
    }

    pub const fn bits(self) -> u64 {
        ((self.high as u64) << 32) | self.low as u64
    }

    /// Extract `width` bits starting at `shift` from the full 64-bit value.
    pub const fn field(self, shift: u32, width: u32) -> u64 {
        (self.bits() >> shift) & ((1u64 << width) - 1)
    }
}

/// Privileged hardware access, implemented outside the engine.
pub trait RegisterDriver: Send + Sync {
    /// Read an MSR on the logical CPU the calling thread is running on.
    fn read_msr(&self, index: u32) -> io::Result<MsrValue>;

    /// Read a 32-bit register from PCI configuration space.
    fn read_pci_config(&self, address: PciAddress, register: u32) -> io::Result<u32>;

    /// Write a 32-bit register in PCI configuration space.
    fn write_pci_config(&self, address: PciAddress, register: u32, value: u32) -> io::Result<()>;

    fn read_io_port(&self, _port: u16) -> io::Result<u8> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    fn write_io_port(&self, _port: u16, _value: u8) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }

    /// Copy physical memory starting at `address` into `buf`.
    fn read_physical_memory(&self, _address: u64, _buf: &mut [u8]) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxDriver;

#[cfg(target_os = "linux")]
mod linux {
    use std::collections::HashMap;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::fs::FileExt;
    use std::path::PathBuf;
    use std::sync::{Mutex, PoisonError};

    use super::{MsrValue, PciAddress, RegisterDriver};

    /// Register driver backed by the Linux `msr` module, sysfs PCI config
    /// files, `/dev/port` and `/dev/mem`. Needs root (or `CAP_SYS_RAWIO`).
    #[derive(Default)]
    pub struct LinuxDriver {
        msr_files: Mutex<HashMap<usize, File>>,
    }

    impl LinuxDriver {
        pub fn new() -> Self {
            Self::default()
        }

        /// Whether the `msr` device nodes exist at all.
        pub fn msr_available() -> bool {
            std::path::Path::new("/dev/cpu/0/msr").exists()
        }

        fn current_cpu() -> io::Result<usize> {
            // SAFETY: sched_getcpu takes no arguments and only reports the
            // CPU of the calling thread.
            let cpu = unsafe { libc::sched_getcpu() };
            if cpu < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(cpu as usize)
        }

        fn pci_config_path(address: PciAddress) -> PathBuf {
            PathBuf::from(format!("/sys/bus/pci/devices/{address}/config"))
        }
    }

    impl RegisterDriver for LinuxDriver {
        fn read_msr(&self, index: u32) -> io::Result<MsrValue> {
            let cpu = Self::current_cpu()?;
            let mut files = self.msr_files.lock().unwrap_or_else(PoisonError::into_inner);
            let file = match files.entry(cpu) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    e.insert(File::open(format!("/dev/cpu/{cpu}/msr"))?)
                }
            };
            let mut buf = [0u8; 8];
            file.read_exact_at(&mut buf, u64::from(index))?;
            Ok(MsrValue::from_bits(u64::from_le_bytes(buf)))
        }

        fn read_pci_config(&self, address: PciAddress, register: u32) -> io::Result<u32> {
            let file = File::open(Self::pci_config_path(address))?;
            let mut buf = [0u8; 4];
            file.read_exact_at(&mut buf, u64::from(register))?;
            Ok(u32::from_le_bytes(buf))
        }

        fn write_pci_config(&self, address: PciAddress, register: u32, value: u32) -> io::Result<()> {
            let file = OpenOptions::new()
                .write(true)
                .open(Self::pci_config_path(address))?;
            file.write_all_at(&value.to_le_bytes(), u64::from(register))
        }

        fn read_io_port(&self, port: u16) -> io::Result<u8> {
            let file = File::open("/dev/port")?;
            let mut buf = [0u8; 1];
            file.read_exact_at(&mut buf, u64::from(port))?;
            Ok(buf[0])
        }

        fn write_io_port(&self, port: u16, value: u8) -> io::Result<()> {
            let file = OpenOptions::new().write(true).open("/dev/port")?;
            file.write_all_at(&[value], u64::from(port))
        }

        fn read_physical_memory(&self, address: u64, buf: &mut [u8]) -> io::Result<()> {
            let file = File::open("/dev/mem")?;
            file.read_exact_at(buf, address)
        }
    }
}
