//! CLI for opensensor — CPU clocks, voltages, temperatures and power from the registers.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "opensensor")]
#[command(about = "opensensor — CPU package sensors straight from MSRs, PCI config space and the SMU")]
#[command(version = opensensor_core::VERSION)]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect packages, family profiles and SMU firmware on this machine
    Scan {
        /// Engine config JSON (bus timeout, SMU retries, PM table layouts, renames)
        #[arg(long)]
        config: Option<String>,
    },

    /// Refresh every package and print its sensors
    Poll {
        /// Delay between refresh cycles in milliseconds
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Number of cycles (default: until Ctrl+C)
        #[arg(long)]
        count: Option<u64>,

        /// Print one JSON line of snapshots per cycle
        #[arg(long)]
        json: bool,

        /// Engine config JSON
        #[arg(long)]
        config: Option<String>,
    },

    /// Measure the timestamp counter frequency against the system clock
    Calibrate {
        /// Override the number of timed passes
        #[arg(long)]
        passes: Option<u32>,

        /// Override the sampling window in milliseconds
        #[arg(long)]
        window_ms: Option<f64>,

        /// Logical CPU to pin to while measuring
        #[arg(long, default_value = "0")]
        cpu: usize,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp_millis()
        .init();

    match cli.command {
        Commands::Scan { config } => commands::scan::run(config.as_deref()),
        Commands::Poll {
            interval_ms,
            count,
            json,
            config,
        } => commands::poll::run(commands::poll::PollCommandConfig {
            interval_ms,
            count,
            json,
            config_path: config.as_deref(),
        }),
        Commands::Calibrate {
            passes,
            window_ms,
            cpu,
        } => commands::calibrate::run(passes, window_ms, cpu),
    }
}
