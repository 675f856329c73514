//! Serialized access to the register driver.
//!
//! PCI configuration space, I/O ports and SMN index/data pairs are shared by
//! everything in the process, so every access goes through one bus lock with
//! a bounded wait. When the lock cannot be taken within the timeout the call
//! fails with [`Error::BusBusy`] rather than blocking: callers treat that as
//! "no value this cycle".
//!
//! MSR reads are per logical CPU and need no lock, but they do need the
//! thread pinned, so [`RegisterBus::read_msr`] takes the open
//! [`AffinityScope`] as proof.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::affinity::AffinityScope;
use crate::driver::{MsrValue, PciAddress, RegisterDriver};
use crate::error::{Error, Result};

/// Default bounded wait for the bus lock.
pub const DEFAULT_BUS_TIMEOUT: Duration = Duration::from_millis(10);

/// An index/data register pair in PCI config space that windows into the
/// System Management Network (SMN) address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmnPort {
    pub device: PciAddress,
    pub index_register: u32,
    pub data_register: u32,
}

/// Owned, injectable register bus shared by every processor in the process.
pub struct RegisterBus {
    driver: Arc<dyn RegisterDriver>,
    held: Mutex<bool>,
    released: Condvar,
    timeout: Duration,
}

impl RegisterBus {
    pub fn new(driver: Arc<dyn RegisterDriver>) -> Self {
        Self::with_timeout(driver, DEFAULT_BUS_TIMEOUT)
    }

    pub fn with_timeout(driver: Arc<dyn RegisterDriver>, timeout: Duration) -> Self {
        Self {
            driver,
            held: Mutex::new(false),
            released: Condvar::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read an MSR on the CPU the open scope is bound to.
    pub fn read_msr(&self, _scope: &AffinityScope<'_>, index: u32) -> Result<MsrValue> {
        self.driver
            .read_msr(index)
            .map_err(|source| Error::Msr { index, source })
    }

    /// Physical memory is not behind the bus lock.
    pub fn read_physical_memory(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.driver
            .read_physical_memory(address, buf)
            .map_err(|source| Error::PhysicalMemory { address, source })
    }

    /// Take the bus lock, waiting at most the configured timeout.
    pub fn lock(&self) -> Result<BusGuard<'_>> {
        self.lock_timeout(self.timeout)
    }

    /// Take the bus lock, waiting at most `timeout`.
    pub fn lock_timeout(&self, timeout: Duration) -> Result<BusGuard<'_>> {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut held, _) = self
            .released
            .wait_timeout_while(held, timeout, |held| *held)
            .unwrap_or_else(PoisonError::into_inner);
        if *held {
            return Err(Error::BusBusy { timeout });
        }
        *held = true;
        Ok(BusGuard { bus: self })
    }

    pub fn read_pci_config(&self, address: PciAddress, register: u32) -> Result<u32> {
        self.lock()?.read_pci_config(address, register)
    }

    pub fn write_pci_config(&self, address: PciAddress, register: u32, value: u32) -> Result<()> {
        self.lock()?.write_pci_config(address, register, value)
    }

    pub fn read_io_port(&self, port: u16) -> Result<u8> {
        self.lock()?.read_io_port(port)
    }

    pub fn write_io_port(&self, port: u16, value: u8) -> Result<()> {
        self.lock()?.write_io_port(port, value)
    }

    pub fn read_smn(&self, port: SmnPort, address: u32) -> Result<u32> {
        self.lock()?.read_smn(port, address)
    }

    fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        self.released.notify_one();
    }
}

/// Proof of bus ownership. Released on drop, on every exit path.
pub struct BusGuard<'a> {
    bus: &'a RegisterBus,
}

impl BusGuard<'_> {
    pub fn read_pci_config(&self, address: PciAddress, register: u32) -> Result<u32> {
        self.bus
            .driver
            .read_pci_config(address, register)
            .map_err(|source| Error::Pci {
                address,
                register,
                source,
            })
    }

    pub fn write_pci_config(&self, address: PciAddress, register: u32, value: u32) -> Result<()> {
        self.bus
            .driver
            .write_pci_config(address, register, value)
            .map_err(|source| Error::Pci {
                address,
                register,
                source,
            })
    }

    pub fn read_io_port(&self, port: u16) -> Result<u8> {
        self.bus
            .driver
            .read_io_port(port)
            .map_err(|source| Error::IoPort { port, source })
    }

    pub fn write_io_port(&self, port: u16, value: u8) -> Result<()> {
        self.bus
            .driver
            .write_io_port(port, value)
            .map_err(|source| Error::IoPort { port, source })
    }

    /// Select `address` through the index register, then read the data register.
    pub fn read_smn(&self, port: SmnPort, address: u32) -> Result<u32> {
        self.write_pci_config(port.device, port.index_register, address)?;
        self.read_pci_config(port.device, port.data_register)
    }

    pub fn write_smn(&self, port: SmnPort, address: u32, value: u32) -> Result<()> {
        self.write_pci_config(port.device, port.index_register, address)?;
        self.write_pci_config(port.device, port.data_register, value)
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        self.bus.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Instant;

    use super::*;
    use crate::affinity::Affinity;
    use crate::mock::MockMachine;

    fn bus_with(machine: &Arc<MockMachine>, timeout: Duration) -> RegisterBus {
        RegisterBus::with_timeout(machine.clone(), timeout)
    }

    #[test]
    fn pci_read_goes_through_driver() {
        let machine = Arc::new(MockMachine::new(1));
        let dev = PciAddress::new(0, 0x18, 3);
        machine.set_pci(dev, 0xE4, 0xCAFE);
        let bus = bus_with(&machine, DEFAULT_BUS_TIMEOUT);
        assert_eq!(bus.read_pci_config(dev, 0xE4).unwrap(), 0xCAFE);
        bus.write_pci_config(dev, 0xE4, 7).unwrap();
        assert_eq!(machine.pci_value(dev, 0xE4), Some(7));
    }

    #[test]
    fn contended_lock_fails_fast() {
        let machine = Arc::new(MockMachine::new(1));
        let bus = Arc::new(bus_with(&machine, Duration::from_millis(10)));

        let (locked_tx, locked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let holder = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                let _guard = bus.lock().unwrap();
                locked_tx.send(()).unwrap();
                done_rx.recv().unwrap();
            })
        };
        locked_rx.recv().unwrap();

        let t0 = Instant::now();
        let err = bus.read_pci_config(PciAddress::HOST_BRIDGE, 0).unwrap_err();
        let waited = t0.elapsed();
        assert!(matches!(err, Error::BusBusy { .. }));
        assert!(err.is_transient());
        assert!(waited >= Duration::from_millis(10));
        assert!(waited < Duration::from_millis(500), "waited {waited:?}");

        done_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(bus.read_pci_config(PciAddress::HOST_BRIDGE, 0).is_ok());
    }

    #[test]
    fn guard_released_after_failed_access() {
        let machine = Arc::new(MockMachine::new(1));
        machine.fail_pci(PciAddress::HOST_BRIDGE, 0x10);
        let bus = bus_with(&machine, Duration::from_millis(5));
        assert!(matches!(
            bus.read_pci_config(PciAddress::HOST_BRIDGE, 0x10),
            Err(Error::Pci { .. })
        ));
        // The failed read must not have leaked the lock.
        assert!(bus.lock().is_ok());
    }

    #[test]
    fn io_port_access_is_serialized_and_fails_fast() {
        let machine = Arc::new(MockMachine::new(1));
        machine.set_io_port(0xCF9, 0x02);
        let bus = bus_with(&machine, Duration::from_millis(10));

        assert_eq!(bus.read_io_port(0xCF9).unwrap(), 0x02);
        bus.write_io_port(0xCF9, 0x06).unwrap();
        assert_eq!(machine.io_port_value(0xCF9), Some(0x06));

        let guard = bus.lock().unwrap();
        let t0 = Instant::now();
        let err = bus.write_io_port(0xCF9, 0x0E).unwrap_err();
        assert!(matches!(err, Error::BusBusy { .. }));
        assert!(t0.elapsed() < Duration::from_millis(500));
        assert_eq!(guard.read_io_port(0xCF9).unwrap(), 0x06);
        drop(guard);

        assert!(matches!(
            bus.read_io_port(0x80),
            Err(Error::IoPort { port: 0x80, .. })
        ));
        assert!(bus.lock().is_ok());
    }

    #[test]
    fn smn_read_uses_index_data_pair() {
        let machine = Arc::new(MockMachine::new(1));
        machine.set_smn(0x0005_9800, 0x1234_0000);
        let bus = bus_with(&machine, DEFAULT_BUS_TIMEOUT);
        let port = MockMachine::THERMAL_SMN_PORT;
        assert_eq!(bus.read_smn(port, 0x0005_9800).unwrap(), 0x1234_0000);
    }

    #[test]
    fn msr_read_targets_scoped_cpu() {
        let machine = Arc::new(MockMachine::new(2));
        machine.set_msr(0, 0x198, 0x1100);
        machine.set_msr(1, 0x198, 0x2200);
        let bus = bus_with(&machine, DEFAULT_BUS_TIMEOUT);

        let scope = AffinityScope::enter(&*machine, Affinity::single(1)).unwrap();
        assert_eq!(bus.read_msr(&scope, 0x198).unwrap().bits(), 0x2200);
        drop(scope);

        let scope = AffinityScope::enter(&*machine, Affinity::single(0)).unwrap();
        assert_eq!(bus.read_msr(&scope, 0x198).unwrap().bits(), 0x1100);
    }
}
