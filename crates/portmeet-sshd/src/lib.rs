//! Child `sshd` layer for the portmeet rendezvous broker
//!
//! The broker never relays payload bytes itself; it launches one hardened
//! `sshd` per tunnel and lets OpenSSH's `AllowTcpForwarding` do the work.
//! This crate owns everything around those children:
//!
//! * host-key bootstrap ([`hostkeys`])
//! * per-tunnel `AuthorizedKeysCommand` scripts ([`keyscript`])
//! * spawning, readiness probing, and supervision ([`supervisor`])

use thiserror::Error;

pub mod hostkeys;
pub mod keyscript;
pub mod supervisor;

pub use hostkeys::HostKeys;
pub use keyscript::KeyScripts;
pub use supervisor::{SshdSupervisor, TunnelHandle, TunnelSpawner};

/// Errors from the child-process layer.
#[derive(Debug, Error)]
pub enum SshdError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh-keygen failed for {path}: {reason}")]
    Keygen { path: String, reason: String },

    #[error("failed to spawn sshd: {0}")]
    Spawn(String),

    #[error("sshd on port {port} did not become ready within {waited_ms}ms")]
    NotReady { port: u16, waited_ms: u64 },
}

/// Result type for child-process operations.
pub type SshdResult<T> = Result<T, SshdError>;
