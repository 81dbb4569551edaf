mod client;
mod config;
mod daemon;
mod egressproxy;
mod logstream;
mod netpolicy;
mod protocol;
mod retry;
mod sandbox;
mod version;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::client::Client;
use crate::config::Config;
use crate::daemon::Service;

#[derive(Parser)]
#[command(name = "nexusd", about = "Edge agent executing sandboxed compute directives")]
enum Cli {
    /// Poll the mothership for directives and execute them (default)
    #[command(alias = "run")]
    Serve {
        /// Path to the nexusd config YAML
        #[arg(long, default_value = "/etc/nexusd/config.yaml")]
        config: PathBuf,
    },
    /// Enroll this territory with the mothership and print the response
    Enroll {
        #[arg(long, default_value = "/etc/nexusd/config.yaml")]
        config: PathBuf,
        /// One-time enrollment token issued by the mothership
        #[arg(long)]
        enroll_token: String,
        /// Territory name override (defaults to the configured name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Print version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let cli = if args.len() <= 1 {
        // No subcommand given: serve with the default config path, but
        // keep --help/--version working through clap.
        Cli::Serve {
            config: PathBuf::from("/etc/nexusd/config.yaml"),
        }
    } else {
        Cli::parse()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("nexusd=info,hyper=warn,reqwest=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli {
        Cli::Serve { config } => run_serve(&config).await,
        Cli::Enroll {
            config,
            enroll_token,
            name,
        } => run_enroll(&config, enroll_token, name).await,
        Cli::Version => {
            println!("nexusd {}", version::VERSION);
            Ok(())
        }
    }
}

async fn run_serve(config_path: &std::path::Path) -> Result<()> {
    let cfg = Config::load(config_path)?;
    let service = Arc::new(Service::new(cfg).context("init nexusd")?);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    service.serve(cancel).await
}

async fn run_enroll(
    config_path: &std::path::Path,
    enroll_token: String,
    name: Option<String>,
) -> Result<()> {
    let cfg = Config::load(config_path)?;
    let client = Client::new(&cfg)?;

    let mut labels = protocol::LooseMap::new();
    for (k, v) in &cfg.labels {
        labels.insert(k.clone(), serde_json::Value::String(v.clone()));
    }

    let req = protocol::EnrollRequest {
        enroll_token,
        name: name.unwrap_or_else(|| cfg.name.clone()),
        labels,
        ..Default::default()
    };
    let resp = client.enroll(&req).await.context("enroll failed")?;
    println!("{}", serde_json::to_string_pretty(&resp)?);
    Ok(())
}

/// SIGINT/SIGTERM cancel the root context for a graceful drain; a second
/// signal exits immediately.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");

        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        tracing::info!("shutdown signal received, draining");
        cancel.cancel();

        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        tracing::warn!("second shutdown signal, exiting immediately");
        std::process::exit(1);
    });
}
