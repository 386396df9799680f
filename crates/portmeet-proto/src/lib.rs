//! Signaling protocol for the portmeet rendezvous broker
//!
//! Agents and the broker exchange JSON text frames over a websocket. Every
//! frame is one [`SignalMessage`], discriminated by its `type` field.

pub mod messages;

pub use messages::{ClientType, SignalMessage};

/// Smallest port an agent may name in a request or policy list.
///
/// `u16` already bounds the upper end; 0 is reserved by the outbound
/// `tunnel_connect` sent to receivers and is never accepted inbound.
pub const MIN_PORT: u16 = 1;

/// Whether a port named by an agent is acceptable.
pub fn valid_port(port: u16) -> bool {
    port >= MIN_PORT
}
