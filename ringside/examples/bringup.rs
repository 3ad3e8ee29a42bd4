//! Brings the first configured simulator device online and reports which
//! devices the harness selected.
//!
//! Needs a running ofono with at least one phonesim modem configured on
//! 127.0.0.1, and `phonesim` on the `PATH`.
//!
//! ```text
//! cargo run --example bringup -- -v
//! ```

use std::path::PathBuf;

use clap::Parser;
use ringside::{Config, ExitOnPrecondition, Harness};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Bring a simulated modem online")]
struct Args {
    /// Echo every observed event to stdout.
    #[arg(short, long)]
    verbose: bool,

    /// Simulator device table.
    #[arg(long)]
    device_table: Option<PathBuf>,

    /// Index of the selected device to bring up.
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Logging filter, in `tracing_subscriber::EnvFilter` syntax.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ringside::Result {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = Config::from_env();
    let verbose = config.verbose() || args.verbose;
    config = config.with_verbose(verbose);
    if let Some(path) = args.device_table {
        config = config.with_device_table(path);
    }

    let mut harness = Harness::connect(config).await.exit_on_precondition()?;
    for (index, device) in harness.devices().enumerate() {
        println!("{index}: {} on port {}", device.name(), device.port());
    }

    let result = harness.bring_online(args.device).await.map(|d| d.name().to_owned());
    let summary = harness.finish().await;
    let name = result?;
    println!("{name} is online ({summary})");
    Ok(())
}
