//! Protocol message types

use serde::{Deserialize, Serialize};

/// Which side of a tunnel an agent plays.
///
/// Only senders are discoverable as connection targets; receivers initiate
/// `connect_to_host`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// Exposes a local TCP service through the tunnel.
    Sender,
    /// Consumes the sender's service.
    Receiver,
}

/// Main signaling message enum, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Sent by an agent to register with the broker.
    Register {
        ssh_key: String,
        uuid: String,
        auto_accept: bool,
        port_whitelist: Vec<u16>,
        port_blacklist: Vec<u16>,
        client_type: ClientType,
    },
    /// Sent by a receiver to reach a sender, addressed by uuid prefix.
    ConnectToHost { target: String, port: u16 },
    /// Sent by the broker to a sender without auto-accept, asking it to
    /// confirm an incoming request.
    ConnectConfirm { source_client: String, port: u16 },
    /// Sender's answer to `connect_confirm`.
    ConnectAccept {},
    ConnectDeny {},
    /// Sent by the broker to both peers once their sshd is up.
    ///
    /// `forwarded_port` is the sender's tunneled port; receivers get 0.
    TunnelConnect {
        client_type: ClientType,
        user: String,
        sshd_port: u16,
        local_port: u16,
        forwarded_port: u16,
    },
    /// Sent by the broker to the surviving peer when a tunnel goes down.
    TunnelClose {},
    /// Generic broker response.
    Response {
        success: bool,
        error: Option<String>,
    },
}

impl SignalMessage {
    /// A successful `response`.
    pub fn ok() -> Self {
        SignalMessage::Response {
            success: true,
            error: None,
        }
    }

    /// A failed `response` carrying a human-readable reason.
    pub fn err(error: impl Into<String>) -> Self {
        SignalMessage::Response {
            success: false,
            error: Some(error.into()),
        }
    }
}
