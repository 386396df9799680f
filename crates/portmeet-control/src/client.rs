//! Registered agents

use chrono::{DateTime, Utc};
use portmeet_proto::{ClientType, SignalMessage};
use tokio::sync::mpsc;
use tracing::debug;

use crate::policy::PortPolicy;

/// Identity of one websocket, assigned at accept time.
///
/// A uuid can move between sockets (re-registration); a `ConnId` never does,
/// which is what lets the reaper tell a stale socket from a live one.
pub type ConnId = u64;

/// Outbound half of a socket; the writer task drains the other end.
pub type Outbox = mpsc::UnboundedSender<SignalMessage>;

/// One connected agent.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub uuid: String,
    /// Public key as one authorized_keys line, without an options prefix.
    pub ssh_key: String,
    pub auto_accept: bool,
    pub policy: PortPolicy,
    pub client_type: ClientType,
    pub conn_id: ConnId,
    pub outbox: Outbox,
    pub connected_at: DateTime<Utc>,
}

impl RegisteredClient {
    /// Queue a message for this agent's socket.
    ///
    /// A closed socket is not an error here; its reaper is already on the
    /// way.
    pub fn send(&self, message: SignalMessage) {
        if self.outbox.send(message).is_err() {
            debug!(uuid = %self.uuid, "dropping message for a closed socket");
        }
    }
}
