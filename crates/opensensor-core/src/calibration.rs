//! Timestamp-counter frequency estimation by busy-wait sampling.
//!
//! A wall-clock tick source and the hardware cycle counter are sampled across
//! a busy-wait window. Each pass yields `cycles / seconds` plus an error term:
//! how far past the intended window edges the loop actually observed the
//! clock. Short passes are noisy, so several are taken and the one with the
//! lowest error wins; sampling stops early once the error is small enough.
//!
//! The clock pair sits behind [`CycleClock`] so tests drive the algorithm with
//! a deterministic fake.

use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Wall-clock ticks paired with a free-running hardware cycle counter.
pub trait CycleClock {
    /// Monotonic wall-clock ticks.
    fn ticks(&self) -> u64;

    /// Wall-clock ticks per second.
    fn ticks_per_second(&self) -> f64;

    /// Current value of the hardware cycle counter.
    fn cycles(&self) -> u64;
}

/// `Instant`-based ticks (nanoseconds) with `rdtsc` cycles.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// `None` on architectures without a readable timestamp counter.
    pub fn new() -> Option<Self> {
        if cfg!(any(target_arch = "x86_64", target_arch = "x86")) {
            Some(Self {
                epoch: Instant::now(),
            })
        } else {
            None
        }
    }
}

impl CycleClock for SystemClock {
    fn ticks(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn ticks_per_second(&self) -> f64 {
        1e9
    }

    #[cfg(target_arch = "x86_64")]
    fn cycles(&self) -> u64 {
        // SAFETY: rdtsc has no preconditions on x86_64.
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    #[cfg(target_arch = "x86")]
    fn cycles(&self) -> u64 {
        // SAFETY: SystemClock is only constructed where rdtsc exists.
        unsafe { core::arch::x86::_rdtsc() }
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
    fn cycles(&self) -> u64 {
        0
    }
}

/// Calibration tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Zero-length passes run first to warm caches and branch predictors.
    pub warmup_passes: u32,
    /// Maximum number of timed passes.
    pub passes: u32,
    /// Length of each timed pass in milliseconds.
    pub window_ms: f64,
    /// Stop as soon as a pass reaches this error.
    pub target_error: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            warmup_passes: 2,
            passes: 5,
            window_ms: 25.0,
            target_error: 1e-4,
        }
    }
}

/// Result of one pass, or the best of several.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TscEstimate {
    /// Cycles per microsecond.
    pub frequency_mhz: f64,
    /// Relative overshoot at the window edges.
    pub error: f64,
}

#[derive(Debug, Clone, Default)]
pub struct FrequencyCalibrator {
    config: CalibrationConfig,
}

impl FrequencyCalibrator {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    /// Best-of-N estimate. `None` if no pass produced a usable sample.
    pub fn estimate(&self, clock: &dyn CycleClock) -> Option<TscEstimate> {
        for _ in 0..self.config.warmup_passes {
            let _ = self.sample(clock, 0.0);
        }

        let window = self.config.window_ms * 1e-3;
        let mut best: Option<TscEstimate> = None;
        for _ in 0..self.config.passes {
            let Some(pass) = self.sample(clock, window) else {
                continue;
            };
            if best.is_none_or(|b| pass.error < b.error) {
                best = Some(pass);
            }
            if best.is_some_and(|b| b.error < self.config.target_error) {
                break;
            }
        }

        if let Some(b) = best {
            log::info!(
                "TSC calibrated at {:.3} MHz (error {:.2e})",
                b.frequency_mhz,
                b.error
            );
        }
        best
    }

    /// One busy-wait pass of `window` seconds.
    pub fn sample(&self, clock: &dyn CycleClock, window: f64) -> Option<TscEstimate> {
        let tps = clock.ticks_per_second();
        let ticks = (window * tps) as u64;
        // Start slightly in the future so the first edge is observed from a spin.
        let time_begin = clock.ticks() + (0.001 * ticks as f64).ceil() as u64;
        let time_end = time_begin + ticks;

        while clock.ticks() < time_begin {
            std::hint::spin_loop();
        }
        let count_begin = clock.cycles();
        let after_begin = clock.ticks();

        while clock.ticks() < time_end {
            std::hint::spin_loop();
        }
        let count_end = clock.cycles();
        let after_end = clock.ticks();

        let delta = (time_end - time_begin) as f64;
        if delta <= 0.0 {
            return None;
        }

        let cycles = count_end.wrapping_sub(count_begin) as f64;
        let frequency_mhz = 1e-6 * cycles * tps / delta;
        let begin_error = after_begin.saturating_sub(time_begin) as f64 / delta;
        let end_error = after_end.saturating_sub(time_end) as f64 / delta;
        let error = begin_error + end_error;

        (frequency_mhz.is_finite() && frequency_mhz > 0.0).then_some(TscEstimate {
            frequency_mhz,
            error,
        })
    }
}
