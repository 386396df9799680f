//! Broker error kinds
//!
//! Every variant maps to a `response{success:false}` on the offending
//! socket; none of them is fatal to the socket or the process.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("invalid message: {0}")]
    SchemaInvalid(String),

    #[error("you are not registered")]
    NotRegistered,

    #[error("only receivers may request a connection")]
    NotReceiver,

    #[error("no match for host prefix \"{0}\"")]
    TargetNotFound(String),

    #[error("ambiguous prefix \"{0}\": more than one host matches")]
    TargetAmbiguous(String),

    #[error("the target host disconnected")]
    TargetDisconnected,

    #[error("port {port} is not allowed by the host's {rule}")]
    PortDenied { port: u16, rule: &'static str },

    #[error("Server is full")]
    ServerFull,

    #[error("The client denied the connection")]
    PeerDenied,

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_agent_facing_phrases() {
        assert_eq!(BrokerError::ServerFull.to_string(), "Server is full");
        assert_eq!(
            BrokerError::PeerDenied.to_string(),
            "The client denied the connection"
        );
        assert!(BrokerError::TargetAmbiguous("CA".into())
            .to_string()
            .contains("ambiguous prefix"));
        assert!(BrokerError::NotRegistered
            .to_string()
            .contains("not registered"));
        assert!(BrokerError::PortDenied {
            port: 8080,
            rule: "whitelist"
        }
        .to_string()
        .contains("whitelist"));
        assert!(BrokerError::TargetNotFound("ZZ".into())
            .to_string()
            .contains("no match"));
    }
}
