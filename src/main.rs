mod cache;
mod config;
mod consensus;
mod engine;
mod error;
mod executor;
mod fanout;
mod model;
mod server;
#[cfg(test)]
mod testutil;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{EngineConfig, load_config};
use crate::engine::Engine;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Multi-upstream DNS resolver with consensus and a freshness cache",
    long_about = None
)]
struct Args {
    /// Config file path (JSON). Built-in defaults when omitted.
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,
    /// Replace the configured upstream list (repeatable).
    #[arg(long = "upstream", global = true)]
    upstreams: Vec<String>,
    /// Enable debug logging.
    #[arg(long = "debug", default_value_t = false, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve one name and print the outcome as JSON.
    Resolve {
        name: String,
        #[arg(short = 't', long = "type", default_value = "A")]
        qtype: String,
    },
    /// Answer DNS queries over UDP and TCP.
    Serve {
        /// UDP worker count (defaults to the CPU count).
        #[arg(long = "udp-workers", default_value_t = 0)]
        udp_workers: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut cfg = match &args.config {
        Some(path) => load_config(path).context("load config")?,
        None => EngineConfig::default(),
    };
    if !args.upstreams.is_empty() {
        cfg.upstreams = args.upstreams.clone();
    }
    let engine = Engine::new(&cfg).context("build engine")?;

    match args.command {
        Command::Resolve { name, qtype } => {
            let result = engine.resolve(&name, &qtype).await;
            engine.shutdown().await;
            match result {
                Ok(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    error!(kind = err.kind(), error = %err, "resolve failed");
                    eprintln!("{}: {}", err.kind(), err);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Serve { udp_workers } => {
            let bind_udp: SocketAddr = cfg.bind_udp.parse().context("parse bind addr")?;
            let bind_tcp: SocketAddr = cfg.bind_tcp.parse().context("parse tcp bind addr")?;
            let udp_workers = if udp_workers > 0 {
                udp_workers
            } else {
                num_cpus::get()
            };

            let served = tokio::select! {
                res = server::serve(engine.clone(), bind_udp, bind_tcp, udp_workers) => res,
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    Ok(())
                }
            };
            engine.shutdown().await;
            if let Err(err) = &served {
                warn!(error = %err, "server stopped");
            }
            served.map(|_| ExitCode::SUCCESS)
        }
    }
}

/// Logs go to stderr so `resolve` output stays clean JSON. `RUST_LOG` wins
/// over `--debug`.
fn init_tracing(debug: bool) {
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(debug)
        .with_ansi(false);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
