//! Energy-counter to power conversion.
//!
//! RAPL-style energy status registers expose a 32-bit counter that grows
//! monotonically and wraps. Power is the counter delta between two samples
//! times the per-model energy unit, divided by the wall-clock time between
//! them.
//!
//! Samples with zero or negative elapsed time are dropped everywhere (package
//! and per-core counters alike): no value is produced and the stored baseline
//! is kept, so the next good sample covers the whole interval.

use std::time::Instant;

/// Counter delta with unsigned wraparound at 2^32.
pub fn energy_delta(previous: u32, current: u32) -> u64 {
    if current >= previous {
        u64::from(current - previous)
    } else {
        u64::from(0xFFFF_FFFF - previous) + u64::from(current)
    }
}

/// A raw counter reading and when it was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnergySample {
    pub raw: u32,
    pub at: Instant,
}

/// Per-counter state: the previous sample and the joules-per-increment unit.
#[derive(Debug, Clone)]
pub struct EnergyAccumulator {
    unit_joules: f64,
    previous: Option<EnergySample>,
}

impl EnergyAccumulator {
    pub fn new(unit_joules: f64) -> Self {
        Self {
            unit_joules,
            previous: None,
        }
    }

    pub fn unit_joules(&self) -> f64 {
        self.unit_joules
    }

    pub fn previous(&self) -> Option<EnergySample> {
        self.previous
    }

    /// Feed a counter reading taken now. Returns watts once a baseline exists.
    pub fn sample(&mut self, raw: u32) -> Option<f64> {
        self.sample_at(raw, Instant::now())
    }

    /// Feed a counter reading taken at `at`.
    pub fn sample_at(&mut self, raw: u32, at: Instant) -> Option<f64> {
        let current = EnergySample { raw, at };
        let Some(previous) = self.previous else {
            self.previous = Some(current);
            return None;
        };

        let elapsed = at.saturating_duration_since(previous.at).as_secs_f64();
        if !(elapsed.is_finite() && elapsed > 0.0) {
            return None;
        }

        self.previous = Some(current);
        let power = energy_delta(previous.raw, raw) as f64 * self.unit_joules / elapsed;
        power.is_finite().then_some(power)
    }

    /// Forget the baseline; the next sample starts over.
    pub fn reset(&mut self) {
        self.previous = None;
    }
}
