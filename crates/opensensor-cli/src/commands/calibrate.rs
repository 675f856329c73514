use opensensor_core::{CalibrationConfig, FrequencyCalibrator, SystemClock, TscEstimate};

pub fn run(passes: Option<u32>, window_ms: Option<f64>, cpu: usize) {
    let Some(clock) = SystemClock::new() else {
        eprintln!("Error: this architecture has no readable timestamp counter");
        std::process::exit(1);
    };

    let mut config = CalibrationConfig::default();
    if let Some(p) = passes {
        config.passes = p.max(1);
    }
    if let Some(w) = window_ms {
        config.window_ms = w;
    }
    let window_s = config.window_ms * 1e-3;

    println!(
        "Calibrating TSC on cpu {cpu}: {} pass(es) of {} ms",
        config.passes, config.window_ms
    );
    let calibrator = FrequencyCalibrator::new(config.clone());

    let measure = || {
        let samples: Vec<Option<TscEstimate>> = (0..config.passes)
            .map(|_| calibrator.sample(&clock, window_s))
            .collect();
        (samples, calibrator.estimate(&clock))
    };
    let (samples, best) = pin_and_run(cpu, measure);

    for (i, s) in samples.iter().enumerate() {
        match s {
            Some(s) => println!("  pass {:<3} {:>12.3} MHz  error {:.2e}", i + 1, s.frequency_mhz, s.error),
            None => println!("  pass {:<3} {:>12}", i + 1, "-"),
        }
    }
    println!();
    match best {
        Some(b) => println!("TSC frequency: {:.3} MHz (error {:.2e})", b.frequency_mhz, b.error),
        None => {
            eprintln!("No usable calibration pass.");
            std::process::exit(1);
        }
    }
}

/// Run `f` bound to `cpu` where the OS allows it; unpinned otherwise.
#[cfg(target_os = "linux")]
fn pin_and_run<T>(cpu: usize, f: impl FnOnce() -> T) -> T {
    use opensensor_core::{Affinity, AffinityScope, OsAffinity};

    match AffinityScope::enter(&OsAffinity, Affinity::single(cpu)) {
        Ok(scope) => {
            let out = f();
            if let Err(e) = scope.exit() {
                log::warn!("{e}");
            }
            out
        }
        Err(e) => {
            log::warn!("running unpinned: {e}");
            f()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_and_run<T>(_cpu: usize, f: impl FnOnce() -> T) -> T {
    f()
}
