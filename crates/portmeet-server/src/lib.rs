//! Websocket rendezvous broker for SSH port forwarding tunnels
//!
//! Agents connect over a websocket, register under a self-declared uuid, and
//! ask the broker to pair them. The broker allocates a port pair, brings up
//! a hardened per-tunnel `sshd`, and tells both sides where to meet; it
//! never touches the forwarded bytes.

use std::sync::Arc;

use portmeet_proto::SignalMessage;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

pub mod config;
pub mod session;

pub use config::{preflight, ServerArgs};
pub use session::Broker;

/// Accept agent sockets forever, one session task per socket.
pub async fn serve(listener: TcpListener, broker: Arc<Broker>) -> anyhow::Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let broker = broker.clone();
                tokio::spawn(session::handle_socket(broker, stream, peer));
            }
            Err(e) => {
                error!("failed to accept connection: {e}");
            }
        }
    }
}

/// React to child sshd processes that exit without being asked to.
///
/// The supervisor reports the dead child's port; the corresponding tunnel is
/// reaped and both peers hear `tunnel_close`, since neither side closed it.
pub fn spawn_child_exit_reaper(
    broker: Arc<Broker>,
    mut exit_rx: mpsc::UnboundedReceiver<u16>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(sshd_port) = exit_rx.recv().await {
            let Some(reaped) = broker.plane.reap_sshd_port(sshd_port) else {
                // Already torn down through a socket close; nothing to do.
                continue;
            };
            warn!(sshd_port, "tunnel lost its sshd, notifying both peers");
            for peer in &reaped.survivors {
                peer.send(SignalMessage::TunnelClose {});
            }
        }
    })
}
