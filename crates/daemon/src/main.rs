// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Emulator Broker Daemon (brokerd)
//!
//! Long-lived process managing emulator registration, lifecycle, name
//! resolution, and per-emulator TCP proxies. Test harnesses and
//! emulator children talk to it over the length-prefixed JSON protocol;
//! children find the endpoint via `TESTENV_BROKER_ADDRESS`.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tracing::info;

use broker_daemon::config::Config;
use broker_daemon::listener::{ListenCtx, Listener};
use broker_engine::{Broker, BrokerConfig, TokioLauncher};

#[derive(Debug, Parser)]
#[command(name = "brokerd", about = "Emulator broker daemon")]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address override (host:port; port 0 picks a free port)
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    setup_logging();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let listen = args.listen.unwrap_or_else(|| config.listen.clone());

    // Bind before building the engine: children need the actual address
    // in their environment.
    let std_listener = std::net::TcpListener::bind(&listen)?;
    std_listener.set_nonblocking(true)?;
    let socket = tokio::net::TcpListener::from_std(std_listener)?;
    let local_addr = socket.local_addr()?;

    let broker = Arc::new(Broker::new(
        BrokerConfig {
            broker_address: local_addr.to_string(),
            broker_dir: broker_dir(),
            port_ranges: config.port_ranges(),
            default_start_deadline: config.default_start_deadline(),
        },
        Arc::new(TokioLauncher),
    )?);

    // Replay pre-declared rules and emulators; failure aborts startup.
    config.apply(&broker.registry)?;

    let shutdown = Arc::new(Notify::new());
    let ctx = Arc::new(ListenCtx {
        broker: Arc::clone(&broker),
        shutdown: Arc::clone(&shutdown),
    });
    tokio::spawn(Listener::new(socket, ctx).run());

    info!("broker listening on {local_addr}");

    // Signal ready for parent process (test harness waiting for startup)
    println!("READY {local_addr}");

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = shutdown.notified() => {
            info!("Shutdown requested via command");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
    }

    broker.shutdown().await;
    info!("broker stopped");
    Ok(())
}

/// Directory of the broker binary, substituted for `{dir:broker}`.
fn broker_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
