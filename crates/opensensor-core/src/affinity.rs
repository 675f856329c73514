//! Scoped binding of the calling thread to one logical CPU.
//!
//! MSRs are local to the core that executes `rdmsr`, so every per-core read
//! happens inside an [`AffinityScope`]. The scope records the thread's prior
//! CPU set on entry and restores it when dropped, on every exit path.
//!
//! Scopes do not nest: opening a second scope on a thread that already holds
//! one fails with [`Error::NestedAffinityScope`] instead of silently
//! clobbering the saved affinity.

use std::cell::Cell;
use std::fmt;
use std::io;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// OS-level handle for a single logical CPU: processor group plus a bit mask
/// within that group (64 CPUs per group).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Affinity {
    pub group: u16,
    pub mask: u64,
}

impl Affinity {
    pub const GROUP_SIZE: usize = 64;

    /// Handle for logical CPU `cpu` (0-based, across all groups).
    pub const fn single(cpu: usize) -> Self {
        Self {
            group: (cpu / Self::GROUP_SIZE) as u16,
            mask: 1u64 << (cpu % Self::GROUP_SIZE),
        }
    }

    /// Lowest logical CPU index covered by this handle.
    pub fn first_cpu(&self) -> Option<usize> {
        if self.mask == 0 {
            return None;
        }
        Some(self.group as usize * Self::GROUP_SIZE + self.mask.trailing_zeros() as usize)
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.first_cpu() {
            Some(cpu) if self.mask.count_ones() == 1 => write!(f, "logical CPU {cpu}"),
            _ => write!(f, "CPU group {} mask 0x{:x}", self.group, self.mask),
        }
    }
}

/// Arbitrary set of logical CPUs, used to save and restore a thread's full
/// affinity (which may span several groups).
#[derive(Debug, Clone, Default)]
pub struct CpuSet {
    words: Vec<u64>,
}

impl CpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, cpu: usize) {
        let word = cpu / 64;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (cpu % 64);
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.words
            .get(cpu / 64)
            .is_some_and(|w| w & (1u64 << (cpu % 64)) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &w)| {
            (0..64usize)
                .filter(move |bit| w & (1u64 << bit) != 0)
                .map(move |bit| i * 64 + bit)
        })
    }
}

impl PartialEq for CpuSet {
    fn eq(&self, other: &Self) -> bool {
        let len = self.words.len().max(other.words.len());
        (0..len).all(|i| {
            self.words.get(i).copied().unwrap_or(0) == other.words.get(i).copied().unwrap_or(0)
        })
    }
}

impl Eq for CpuSet {}

impl From<Affinity> for CpuSet {
    fn from(affinity: Affinity) -> Self {
        let mut words = vec![0u64; affinity.group as usize + 1];
        words[affinity.group as usize] = affinity.mask;
        Self { words }
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::new();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

/// Reads and changes the CPU affinity of the calling thread.
pub trait AffinityController: Send + Sync {
    fn current(&self) -> io::Result<CpuSet>;

    fn set(&self, cpus: &CpuSet) -> io::Result<()>;
}

thread_local! {
    static SCOPE_OPEN: Cell<bool> = const { Cell::new(false) };
}

/// RAII binding of the current thread to one logical CPU.
///
/// Not `Send`: the saved affinity belongs to the thread that opened it.
pub struct AffinityScope<'a> {
    controller: &'a dyn AffinityController,
    previous: CpuSet,
    target: Affinity,
    restored: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a> AffinityScope<'a> {
    /// Bind the calling thread to `target`, remembering the prior affinity.
    pub fn enter(controller: &'a dyn AffinityController, target: Affinity) -> Result<Self> {
        if SCOPE_OPEN.with(Cell::get) {
            return Err(Error::NestedAffinityScope);
        }
        let previous = controller
            .current()
            .map_err(|source| Error::Affinity { target, source })?;
        controller
            .set(&CpuSet::from(target))
            .map_err(|source| Error::Affinity { target, source })?;
        SCOPE_OPEN.with(|open| open.set(true));
        Ok(Self {
            controller,
            previous,
            target,
            restored: false,
            _thread_bound: PhantomData,
        })
    }

    pub fn target(&self) -> Affinity {
        self.target
    }

    /// The affinity that will be restored on exit.
    pub fn previous(&self) -> &CpuSet {
        &self.previous
    }

    /// Restore the prior affinity and report whether that succeeded.
    pub fn exit(mut self) -> Result<()> {
        self.restore()
            .map_err(|source| Error::AffinityRestore { source })
    }

    fn restore(&mut self) -> io::Result<()> {
        if self.restored {
            return Ok(());
        }
        self.restored = true;
        SCOPE_OPEN.with(|open| open.set(false));
        self.controller.set(&self.previous)
    }
}

impl Drop for AffinityScope<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            log::warn!("failed to restore thread affinity after {}: {e}", self.target);
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::OsAffinity;

#[cfg(target_os = "linux")]
mod linux {
    use std::io;

    use super::{AffinityController, CpuSet};

    /// Affinity controller for the calling thread via
    /// `sched_getaffinity`/`sched_setaffinity`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct OsAffinity;

    impl AffinityController for OsAffinity {
        fn current(&self) -> io::Result<CpuSet> {
            // SAFETY: cpu_set_t is a plain bitmask; all-zero is a valid value.
            let mut raw: libc::cpu_set_t = unsafe { std::mem::zeroed() };
            // SAFETY: pid 0 targets the calling thread and `raw` is a valid,
            // correctly sized buffer.
            let rc = unsafe {
                libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut raw)
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            let max = libc::CPU_SETSIZE as usize;
            // SAFETY: every index is below CPU_SETSIZE.
            Ok((0..max).filter(|&cpu| unsafe { libc::CPU_ISSET(cpu, &raw) }).collect())
        }

        fn set(&self, cpus: &CpuSet) -> io::Result<()> {
            // SAFETY: all-zero cpu_set_t is the empty set.
            let mut raw: libc::cpu_set_t = unsafe { std::mem::zeroed() };
            let max = libc::CPU_SETSIZE as usize;
            for cpu in cpus.iter() {
                if cpu >= max {
                    return Err(io::Error::from(io::ErrorKind::InvalidInput));
                }
                // SAFETY: cpu < CPU_SETSIZE checked above.
                unsafe { libc::CPU_SET(cpu, &mut raw) };
            }
            // SAFETY: pid 0 targets the calling thread; `raw` outlives the call.
            let rc = unsafe {
                libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &raw)
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}
