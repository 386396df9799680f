//! Control plane for the portmeet rendezvous broker
//!
//! Tracks connected agents, live tunnels, and approval round-trips in a
//! single guarded state so port allocation, registration, and teardown are
//! atomic with respect to each other.

pub mod client;
pub mod error;
pub mod pending;
pub mod plane;
pub mod policy;

pub use client::{ConnId, Outbox, RegisteredClient};
pub use error::BrokerError;
pub use pending::PendingApproval;
pub use plane::{ConnectRoute, ControlPlane, DisconnectReport, ReapedTunnel};
pub use policy::PortPolicy;
