//! Rendezvous broker binary
//!
//! Preflight checks, host-key bootstrap, then the websocket listener. All
//! configuration comes from flags or their environment fallbacks; see
//! `--help`.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use portmeet_control::ControlPlane;
use portmeet_server::{preflight, serve, spawn_child_exit_reaper, Broker, ServerArgs};
use portmeet_sshd::{HostKeys, KeyScripts, SshdSupervisor};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_logging(&args.log_level)?;

    preflight(&args)?;

    let host_keys = HostKeys::in_folder(&args.keys_folder);
    host_keys.ensure().context("host key bootstrap failed")?;

    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let supervisor = SshdSupervisor::new(
        args.forwarding_user.clone(),
        host_keys,
        KeyScripts::default(),
        exit_tx,
    );
    let broker = Arc::new(Broker::new(
        ControlPlane::new(args.opened_ports.clone()),
        Arc::new(supervisor),
        args.forwarding_user.clone(),
    ));

    let reaper = spawn_child_exit_reaper(broker.clone(), exit_rx);

    let listener = TcpListener::bind(("0.0.0.0", args.server_port))
        .await
        .with_context(|| format!("could not bind the listener on port {}", args.server_port))?;

    info!("🚀 portmeet broker listening on ws://0.0.0.0:{}", args.server_port);
    info!(
        "candidate sshd ports: {:?}, forwarding user: {}",
        args.opened_ports, args.forwarding_user
    );

    tokio::select! {
        res = serve(listener, broker) => res,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            reaper.abort();
            Ok(())
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
