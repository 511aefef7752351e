//! NTLM Relay - CLI entry point
//!
//! Starts both listeners on ephemeral loopback ports, prints their URLs to
//! stdout, and publishes them in the ports file for the test runner
//! plugin. The process exits 0 on graceful shutdown (`POST /quit` or
//! Ctrl-C) and non-zero when a listener cannot bind.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use ntlm_relay::ports::{self, PortsFile};
use ntlm_relay::{Relay, Settings, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ntlm-relay")]
#[command(version = VERSION)]
#[command(about = "NTLM/Negotiate authenticating proxy for browser test runners")]
struct Args {
    /// Ports file location (defaults to the user data directory)
    #[arg(long = "ports-file")]
    ports_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    // Install aws-lc-rs as the default crypto provider for rustls
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("ntlm-relay-worker")
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "ntlm_relay=debug" } else { "ntlm_relay=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(default_level.parse()?),
        )
        .init();

    info!("NTLM Relay v{}", VERSION);

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Invalid environment configuration: {}", e);
            std::process::exit(1);
        }
    };

    let relay = match Relay::start(settings).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("Failed to start: {}", e);
            std::process::exit(1);
        }
    };

    let config_api_url = relay.config_api_url()?;
    let ntlm_proxy_url = relay.ntlm_proxy_url()?;

    // The launcher reads these from stdout as well as from the ports file
    println!("Config API: {}", config_api_url);
    println!("NTLM proxy: {}", ntlm_proxy_url);

    let ports_path = args.ports_file.unwrap_or_else(ports::default_path);
    let ports_file = PortsFile::new(config_api_url, ntlm_proxy_url);
    if let Err(e) = ports_file.save(&ports_path) {
        error!("Cannot write ports file {}: {}", ports_path.display(), e);
        std::process::exit(1);
    }
    info!("Ports file written to {}", ports_path.display());

    let result = relay.run().await;

    if let Err(e) = PortsFile::delete(&ports_path) {
        error!("Cannot remove ports file {}: {}", ports_path.display(), e);
    }

    if let Err(e) = result {
        error!("Relay error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
