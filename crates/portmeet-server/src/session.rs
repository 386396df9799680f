//! Per-socket signaling sessions
//!
//! One reader and one writer task per agent socket. The reader parses JSON
//! text frames into [`SignalMessage`]s and runs the register / connect /
//! approve / deny state machine against the shared control plane; the writer
//! drains the socket's outbox in order. Protocol errors answer with a
//! failed `response` and leave the socket open; only a close frame or a
//! transport error ends the session and triggers the reaper.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use portmeet_control::{
    BrokerError, ConnId, ConnectRoute, ControlPlane, Outbox, PortPolicy, ReapedTunnel,
    RegisteredClient,
};
use portmeet_proto::{valid_port, ClientType, SignalMessage};
use portmeet_sshd::TunnelSpawner;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Shared broker state handed to every session task.
pub struct Broker {
    pub plane: ControlPlane,
    pub spawner: Arc<dyn TunnelSpawner>,
    /// Login the child sshd admits; agents are told to ssh as this user.
    pub forwarding_user: String,
    next_conn: AtomicU64,
}

impl Broker {
    pub fn new(
        plane: ControlPlane,
        spawner: Arc<dyn TunnelSpawner>,
        forwarding_user: String,
    ) -> Self {
        Self {
            plane,
            spawner,
            forwarding_user,
            next_conn: AtomicU64::new(1),
        }
    }

    fn next_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }
}

/// Drive one agent socket from handshake to reap.
pub async fn handle_socket(broker: Arc<Broker>, stream: TcpStream, peer: SocketAddr) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, "websocket handshake failed: {e}");
            return;
        }
    };

    let conn_id = broker.next_conn_id();
    debug!(%peer, conn_id, "agent socket connected");

    let (sink, mut source) = ws.split();
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_frames(sink, outbox_rx, conn_id));

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => dispatch(&broker, conn_id, &outbox, &text).await,
            Ok(Message::Close(_)) => break,
            // Pings are answered by tungstenite; binary frames are not part
            // of this protocol.
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id, "socket read error: {e}");
                break;
            }
        }
    }

    reap_disconnect(&broker, conn_id);
    debug!(%peer, conn_id, "agent socket closed");

    // The registry entry held the last outbox clone; the writer drains and
    // exits once it is gone.
    drop(outbox);
    let _ = writer.await;
}

/// Serialize the socket's outbox in order.
async fn write_frames(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbox_rx: mpsc::UnboundedReceiver<SignalMessage>,
    conn_id: ConnId,
) {
    while let Some(message) = outbox_rx.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                error!(conn_id, "could not encode outbound message: {e}");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(json)).await {
            debug!(conn_id, "socket write failed: {e}");
            break;
        }
    }
    let _ = sink.close().await;
}

async fn dispatch(broker: &Arc<Broker>, conn_id: ConnId, outbox: &Outbox, text: &str) {
    let message = match serde_json::from_str::<SignalMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            respond_err(outbox, &BrokerError::SchemaInvalid(e.to_string()));
            return;
        }
    };

    match message {
        SignalMessage::Register {
            ssh_key,
            uuid,
            auto_accept,
            port_whitelist,
            port_blacklist,
            client_type,
        } => handle_register(
            broker,
            conn_id,
            outbox,
            ssh_key,
            uuid,
            auto_accept,
            port_whitelist,
            port_blacklist,
            client_type,
        ),
        SignalMessage::ConnectToHost { target, port } => {
            if let Err(e) = handle_connect(broker, conn_id, &target, port).await {
                respond_err(outbox, &e);
            }
        }
        SignalMessage::ConnectAccept {} => handle_answer(broker, conn_id, outbox, true).await,
        SignalMessage::ConnectDeny {} => handle_answer(broker, conn_id, outbox, false).await,
        // Broker-originated variants have no business arriving inbound.
        other => {
            debug!(conn_id, "unexpected inbound message: {other:?}");
            respond_err(
                outbox,
                &BrokerError::SchemaInvalid("unexpected message type".into()),
            );
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_register(
    broker: &Arc<Broker>,
    conn_id: ConnId,
    outbox: &Outbox,
    ssh_key: String,
    uuid: String,
    auto_accept: bool,
    port_whitelist: Vec<u16>,
    port_blacklist: Vec<u16>,
    client_type: ClientType,
) {
    let policy = match PortPolicy::new(port_whitelist, port_blacklist) {
        Ok(policy) => policy,
        Err(e) => {
            respond_err(outbox, &e);
            return;
        }
    };

    let outcome = broker.plane.register(RegisteredClient {
        uuid,
        ssh_key,
        auto_accept,
        policy,
        client_type,
        conn_id,
        outbox: outbox.clone(),
        connected_at: Utc::now(),
    });
    teardown_tunnels(outcome.displaced);

    let _ = outbox.send(SignalMessage::ok());
}

async fn handle_connect(
    broker: &Arc<Broker>,
    conn_id: ConnId,
    target: &str,
    port: u16,
) -> Result<(), BrokerError> {
    if !valid_port(port) {
        return Err(BrokerError::SchemaInvalid(
            "port must be between 1 and 65535".into(),
        ));
    }

    match broker.plane.route_connect(conn_id, target, port)? {
        ConnectRoute::Provision { sender, receiver } => {
            provision(broker, &sender, &receiver, port).await
        }
        ConnectRoute::AwaitApproval {
            sender,
            source_client,
        } => {
            info!(
                host = %sender.uuid,
                source = %source_client,
                port,
                "asking host to confirm the connection"
            );
            sender.send(SignalMessage::ConnectConfirm {
                source_client,
                port,
            });
            Ok(())
        }
    }
}

/// A sender answered `connect_confirm`; resolve the oldest waiting request.
async fn handle_answer(broker: &Arc<Broker>, conn_id: ConnId, outbox: &Outbox, accepted: bool) {
    let Some(approval) = broker.plane.take_pending(conn_id) else {
        let _ = outbox.send(SignalMessage::err("no pending connection request"));
        return;
    };

    let requester = broker.plane.client_by_conn(approval.requester_conn);
    if !accepted {
        info!(requester = %approval.requester_uuid, "host denied the connection");
        if let Some(requester) = requester {
            requester.send(SignalMessage::err(BrokerError::PeerDenied.to_string()));
        }
        return;
    }

    let Some(requester) = requester else {
        debug!(requester = %approval.requester_uuid, "requester left before the answer");
        return;
    };
    let Some(sender) = broker.plane.client_by_conn(conn_id) else {
        return;
    };

    if let Err(e) = provision(broker, &sender, &requester, approval.port).await {
        requester.send(SignalMessage::err(e.to_string()));
    }
}

/// Bring up a tunnel between two registered agents.
///
/// The port pair is reserved first, so parallel provisioning cannot collide;
/// the spawn and readiness probe run without the control-plane lock.
async fn provision(
    broker: &Arc<Broker>,
    sender: &RegisteredClient,
    receiver: &RegisteredClient,
    forwarded_port: u16,
) -> Result<(), BrokerError> {
    let (sshd_port, local_port) = broker
        .plane
        .allocate_and_insert(&sender.uuid, &receiver.uuid)?;

    let authorized_keys = [sender.ssh_key.clone(), receiver.ssh_key.clone()];
    let handle = match broker
        .spawner
        .spawn(sshd_port, local_port, &authorized_keys)
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            error!(sshd_port, "tunnel provisioning failed: {e}");
            broker.plane.abort_reservation(sshd_port);
            return Err(BrokerError::Internal(e.to_string()));
        }
    };

    broker
        .plane
        .attach_and_announce(sshd_port, handle, &broker.forwarding_user, forwarded_port)
}

/// The reaper: run on every socket close, registered or not.
fn reap_disconnect(broker: &Arc<Broker>, conn_id: ConnId) {
    let report = broker.plane.disconnect(conn_id);
    teardown_tunnels(report.tunnels);
    for requester in report.orphaned_requesters {
        requester.send(SignalMessage::err(
            BrokerError::TargetDisconnected.to_string(),
        ));
    }
}

/// Kill reaped children and tell the surviving peers.
///
/// Reservations that never produced a child carry no handle and were never
/// announced, so their peers hear nothing.
fn teardown_tunnels(tunnels: Vec<ReapedTunnel>) {
    for reaped in tunnels {
        let Some(handle) = reaped.handle else {
            continue;
        };
        for peer in &reaped.survivors {
            peer.send(SignalMessage::TunnelClose {});
        }
        handle.kill();
    }
}

fn respond_err(outbox: &Outbox, error: &BrokerError) {
    let _ = outbox.send(SignalMessage::err(error.to_string()));
}
