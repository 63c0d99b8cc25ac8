use anyhow::Result;
use aya::include_bytes_aligned;
use clap::Parser;
use log::warn;

use tlstap::{TlsTapEngine, settings::Settings, telemetry};

#[derive(Debug, Parser)]
#[command(about = "Capture TLS plaintext from OpenSSL and Go programs with eBPF uprobes")]
struct Opt {
    /// Verbose output
    #[clap(short, long)]
    verbose: bool,

    /// PID whose namespace should be traced; may be repeated
    #[clap(short, long = "pid")]
    pids: Vec<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "debug" } else { "info" }),
    )
    .init();

    let mut settings = Settings::new()?;
    if !opt.pids.is_empty() {
        let mut pids = settings.target_pids();
        pids.extend(opt.pids);
        settings.targets.pids = Some(pids);
    }

    if let Err(e) = telemetry::init_metrics() {
        warn!("Failed to initialize metrics: {:#}", e);
    }

    let engine = TlsTapEngine::new(
        settings,
        include_bytes_aligned!(concat!(env!("OUT_DIR"), "/tlstap")),
    )?;
    let result = engine.run().await;

    telemetry::shutdown_metrics();
    result
}
