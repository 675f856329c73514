use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use opensensor_core::{MailboxOutcome, Processor, SensorSnapshot};

pub struct PollCommandConfig<'a> {
    pub interval_ms: u64,
    pub count: Option<u64>,
    pub json: bool,
    pub config_path: Option<&'a str>,
}

pub fn run(cfg: PollCommandConfig<'_>) {
    super::warn_if_unprivileged();
    let config = super::load_config(cfg.config_path);
    let mut processors = super::make_processors(&config);
    if processors.is_empty() {
        eprintln!("No processor packages found.");
        std::process::exit(1);
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)) {
        log::warn!("Ctrl+C handler not installed: {e}");
    }

    let interval = Duration::from_millis(cfg.interval_ms);
    let mut cycle = 0u64;
    while running.load(Ordering::SeqCst) {
        if cfg.count.is_some_and(|n| cycle >= n) {
            break;
        }
        if cycle > 0 {
            sleep_while(&running, interval);
            if !running.load(Ordering::SeqCst) {
                break;
            }
        }
        cycle += 1;

        for cpu in &mut processors {
            let report = cpu.update();
            if report.cores_skipped > 0 || report.register_failures > 0 {
                log::debug!(
                    "package {}: {} core(s) skipped, {} register read(s) failed",
                    cpu.package().id(),
                    report.cores_skipped,
                    report.register_failures
                );
            }
            if report.mailbox == MailboxOutcome::Failed {
                log::debug!("package {}: PM table refresh failed", cpu.package().id());
            }
        }

        if cfg.json {
            let snapshots: Vec<SensorSnapshot> = processors.iter().map(Processor::snapshot).collect();
            match serde_json::to_string(&snapshots) {
                Ok(line) => println!("{line}"),
                Err(e) => {
                    eprintln!("Error serializing snapshot: {e}");
                    std::process::exit(1);
                }
            }
        } else {
            print_cycle(cycle, &processors);
        }
    }
}

fn print_cycle(cycle: u64, processors: &[Processor]) {
    println!("--- cycle {cycle} ---");
    for cpu in processors {
        println!(
            "Package #{}: {} [{}]",
            cpu.package().id(),
            cpu.package().brand(),
            cpu.profile().code_name
        );
        if cpu.sensors().is_empty() {
            println!("  (no readings)");
        }
        for sensor in cpu.sensors().iter() {
            println!("  {sensor}");
        }
    }
    println!();
}

/// Sleep for `total`, waking early once `running` clears.
fn sleep_while(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
