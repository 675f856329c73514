//! In-memory machine for tests and dry runs.
//!
//! [`MockMachine`] implements both [`RegisterDriver`] and
//! [`AffinityController`]. MSR reads only succeed while the calling thread is
//! bound to exactly one online logical CPU, like `rdmsr` through the Linux
//! `msr` device. PCI index/data pairs registered as SMN ports window into a
//! sparse SMN address space, and an SMU mailbox can be installed on top of it
//! that answers commands with canned replies.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::affinity::{AffinityController, CpuSet};
use crate::bus::SmnPort;
use crate::calibration::CycleClock;
use crate::driver::{MsrValue, PciAddress, RegisterDriver};
use crate::mailbox::{SMU_MAX_ARGS, SmuAddresses, SmuStatus};
use crate::profile;

#[derive(Debug, Clone, Copy)]
struct SmuReply {
    status: SmuStatus,
    results: [u32; SMU_MAX_ARGS],
}

#[derive(Debug, Clone, Copy)]
struct PendingReply {
    reply: SmuReply,
    polls_left: u32,
}

#[derive(Default)]
struct State {
    cpus: usize,
    affinity: CpuSet,
    offline: HashSet<usize>,
    msrs: HashMap<(usize, u32), u64>,
    msr_reads: u64,
    pci: HashMap<(PciAddress, u32), u32>,
    failing_pci: HashSet<(PciAddress, u32)>,
    /// SMN ports keyed by (device, index register); value is the latched address.
    smn_ports: HashMap<(PciAddress, u32), u32>,
    smn: HashMap<u32, u32>,
    smn_reads: HashMap<u32, u64>,
    smu: Option<SmuAddresses>,
    smu_replies: HashMap<u32, SmuReply>,
    smu_latency: u32,
    smu_pending: Option<PendingReply>,
    last_smu_command: Option<(u32, [u32; SMU_MAX_ARGS])>,
    memory: Vec<(u64, Vec<u8>)>,
    io_ports: HashMap<u16, u8>,
}

/// A fake machine with `cpus` logical CPUs.
pub struct MockMachine {
    state: Mutex<State>,
}

impl MockMachine {
    /// The host bridge index/data pair used for thermal SMN reads.
    pub const THERMAL_SMN_PORT: SmnPort = profile::THERMAL_SMN_PORT;

    pub fn new(cpus: usize) -> Self {
        let mut state = State {
            cpus,
            affinity: (0..cpus).collect(),
            ..State::default()
        };
        let port = Self::THERMAL_SMN_PORT;
        state.smn_ports.insert((port.device, port.index_register), 0);
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cpu_count(&self) -> usize {
        self.state().cpus
    }

    /// The single CPU the caller is bound to, if any.
    pub fn current_cpu(&self) -> Option<usize> {
        let state = self.state();
        let mut cpus = state.affinity.iter();
        match (cpus.next(), cpus.next()) {
            (Some(cpu), None) => Some(cpu),
            _ => None,
        }
    }

    /// Offline CPUs refuse affinity changes that include them.
    pub fn set_offline(&self, cpu: usize, offline: bool) {
        let mut state = self.state();
        if offline {
            state.offline.insert(cpu);
        } else {
            state.offline.remove(&cpu);
        }
    }

    // -----------------------------------------------------------------------
    // MSR space
    // -----------------------------------------------------------------------

    pub fn set_msr(&self, cpu: usize, index: u32, value: u64) {
        self.state().msrs.insert((cpu, index), value);
    }

    pub fn set_msr_all(&self, index: u32, value: u64) {
        let mut state = self.state();
        for cpu in 0..state.cpus {
            state.msrs.insert((cpu, index), value);
        }
    }

    /// Make subsequent reads of `index` on `cpu` fail.
    pub fn fail_msr(&self, cpu: usize, index: u32) {
        self.state().msrs.remove(&(cpu, index));
    }

    pub fn msr_reads(&self) -> u64 {
        self.state().msr_reads
    }

    // -----------------------------------------------------------------------
    // PCI and SMN space
    // -----------------------------------------------------------------------

    pub fn set_pci(&self, device: PciAddress, register: u32, value: u32) {
        self.state().pci.insert((device, register), value);
    }

    pub fn pci_value(&self, device: PciAddress, register: u32) -> Option<u32> {
        self.state().pci.get(&(device, register)).copied()
    }

    pub fn fail_pci(&self, device: PciAddress, register: u32) {
        self.state().failing_pci.insert((device, register));
    }

    /// Map an I/O port. Unmapped ports fail to read and write.
    pub fn set_io_port(&self, port: u16, value: u8) {
        self.state().io_ports.insert(port, value);
    }

    pub fn io_port_value(&self, port: u16) -> Option<u8> {
        self.state().io_ports.get(&port).copied()
    }

    /// Window SMN space through `port`.
    pub fn add_smn_port(&self, port: SmnPort) {
        self.state()
            .smn_ports
            .insert((port.device, port.index_register), 0);
    }

    pub fn set_smn(&self, address: u32, value: u32) {
        self.state().smn.insert(address, value);
    }

    pub fn smn_value(&self, address: u32) -> Option<u32> {
        self.state().smn.get(&address).copied()
    }

    /// Number of data-register reads that hit `address`.
    pub fn smn_reads(&self, address: u32) -> u64 {
        self.state().smn_reads.get(&address).copied().unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // SMU mailbox emulation
    // -----------------------------------------------------------------------

    /// Install an idle mailbox at `addresses`. Unknown opcodes are answered
    /// with [`SmuStatus::UnknownCommand`].
    pub fn install_smu(&self, addresses: SmuAddresses) {
        let mut state = self.state();
        state
            .smn_ports
            .insert((addresses.port.device, addresses.port.index_register), 0);
        state.smn.insert(addresses.response, SmuStatus::Ok.raw());
        state.smu = Some(addresses);
    }

    pub fn on_smu_command(&self, opcode: u32, status: SmuStatus, results: [u32; SMU_MAX_ARGS]) {
        self.state()
            .smu_replies
            .insert(opcode, SmuReply { status, results });
    }

    /// Number of response polls that read zero before the firmware answers.
    pub fn set_smu_latency(&self, polls: u32) {
        self.state().smu_latency = polls;
    }

    /// Opcode and argument words of the most recent command.
    pub fn last_smu_command(&self) -> Option<(u32, [u32; SMU_MAX_ARGS])> {
        self.state().last_smu_command
    }

    // -----------------------------------------------------------------------
    // Physical memory
    // -----------------------------------------------------------------------

    pub fn set_physical_memory(&self, address: u64, bytes: &[u8]) {
        let mut state = self.state();
        state.memory.retain(|(base, _)| *base != address);
        state.memory.push((address, bytes.to_vec()));
    }
}

impl State {
    fn smn_read(&mut self, address: u32) -> u32 {
        *self.smn_reads.entry(address).or_default() += 1;

        if let Some(smu) = self.smu.filter(|smu| smu.response == address) {
            if let Some(mut pending) = self.smu_pending.take() {
                if pending.polls_left > 0 {
                    pending.polls_left -= 1;
                    self.smu_pending = Some(pending);
                    return 0;
                }
                if pending.reply.status == SmuStatus::Ok {
                    for (i, word) in pending.reply.results.iter().enumerate() {
                        self.smn.insert(smu.arg(i), *word);
                    }
                }
                self.smn.insert(smu.response, pending.reply.status.raw());
            }
        }

        self.smn.get(&address).copied().unwrap_or(0)
    }

    fn smn_write(&mut self, address: u32, value: u32) {
        self.smn.insert(address, value);
        let Some(smu) = self.smu else {
            return;
        };
        if address != smu.command {
            return;
        }

        let mut args = [0u32; SMU_MAX_ARGS];
        for (i, slot) in args.iter_mut().enumerate() {
            *slot = self.smn.get(&smu.arg(i)).copied().unwrap_or(0);
        }
        self.last_smu_command = Some((value, args));

        let reply = self.smu_replies.get(&value).copied().unwrap_or(SmuReply {
            status: SmuStatus::UnknownCommand,
            results: [0; SMU_MAX_ARGS],
        });
        self.smn.insert(smu.response, 0);
        self.smu_pending = Some(PendingReply {
            reply,
            polls_left: self.smu_latency,
        });
    }

    /// The SMN port whose data register is `(device, register)`, if any.
    fn smn_port_for_data(&self, device: PciAddress, register: u32) -> Option<(PciAddress, u32)> {
        // Index and data registers are adjacent dwords on every port we model.
        let index = register.checked_sub(4)?;
        self.smn_ports
            .contains_key(&(device, index))
            .then_some((device, index))
    }
}

impl AffinityController for MockMachine {
    fn current(&self) -> io::Result<CpuSet> {
        Ok(self.state().affinity.clone())
    }

    fn set(&self, cpus: &CpuSet) -> io::Result<()> {
        let mut state = self.state();
        if cpus.is_empty() {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        if cpus.iter().any(|cpu| cpu >= state.cpus) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        // Like sched_setaffinity: offline CPUs are tolerated as long as one
        // CPU in the set can run the thread.
        if cpus.iter().all(|cpu| state.offline.contains(&cpu)) {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }
        state.affinity = cpus.clone();
        Ok(())
    }
}

impl RegisterDriver for MockMachine {
    fn read_msr(&self, index: u32) -> io::Result<MsrValue> {
        let mut state = self.state();
        state.msr_reads += 1;
        let mut bound = state.affinity.iter();
        let cpu = match (bound.next(), bound.next()) {
            (Some(cpu), None) => cpu,
            _ => {
                return Err(io::Error::other(
                    "MSR read without binding to a single CPU",
                ));
            }
        };
        state
            .msrs
            .get(&(cpu, index))
            .map(|&bits| MsrValue::from_bits(bits))
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn read_pci_config(&self, address: PciAddress, register: u32) -> io::Result<u32> {
        let mut state = self.state();
        if state.failing_pci.contains(&(address, register)) {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        if let Some(key) = state.smn_port_for_data(address, register) {
            let latched = state.smn_ports.get(&key).copied().unwrap_or(0);
            return Ok(state.smn_read(latched));
        }
        // Absent devices read as all ones.
        Ok(state
            .pci
            .get(&(address, register))
            .copied()
            .unwrap_or(u32::MAX))
    }

    fn write_pci_config(&self, address: PciAddress, register: u32, value: u32) -> io::Result<()> {
        let mut state = self.state();
        if state.failing_pci.contains(&(address, register)) {
            return Err(io::Error::from(io::ErrorKind::TimedOut));
        }
        if let Some(latched) = state.smn_ports.get_mut(&(address, register)) {
            *latched = value;
            return Ok(());
        }
        if let Some(key) = state.smn_port_for_data(address, register) {
            let latched = state.smn_ports.get(&key).copied().unwrap_or(0);
            state.smn_write(latched, value);
            return Ok(());
        }
        state.pci.insert((address, register), value);
        Ok(())
    }

    fn read_io_port(&self, port: u16) -> io::Result<u8> {
        self.state()
            .io_ports
            .get(&port)
            .copied()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn write_io_port(&self, port: u16, value: u8) -> io::Result<()> {
        match self.state().io_ports.get_mut(&port) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn read_physical_memory(&self, address: u64, buf: &mut [u8]) -> io::Result<()> {
        let state = self.state();
        let end = address + buf.len() as u64;
        for (base, bytes) in &state.memory {
            if address >= *base && end <= base + bytes.len() as u64 {
                let start = (address - base) as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
                return Ok(());
            }
        }
        Err(io::Error::from(io::ErrorKind::AddrNotAvailable))
    }
}

/// Deterministic clock pair: each tick read advances time by `step_ns`, and
/// the cycle counter runs at exactly `hz`.
pub struct MockClock {
    now_ns: AtomicU64,
    step_ns: u64,
    hz: f64,
}

impl MockClock {
    pub fn new(hz: f64, step_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(0),
            step_ns,
            hz,
        }
    }
}

impl CycleClock for MockClock {
    fn ticks(&self) -> u64 {
        self.now_ns.fetch_add(self.step_ns, Ordering::Relaxed) + self.step_ns
    }

    fn ticks_per_second(&self) -> f64 {
        1e9
    }

    fn cycles(&self) -> u64 {
        (self.now_ns.load(Ordering::Relaxed) as f64 * self.hz / 1e9) as u64
    }
}
