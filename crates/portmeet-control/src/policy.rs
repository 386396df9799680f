//! Per-sender port policy
//!
//! A sender may declare which of its local ports receivers can ask for.
//! The whitelist takes precedence: when non-empty, only listed ports are
//! permitted; otherwise a non-empty blacklist denies its entries; otherwise
//! everything is allowed. Declaring both lists at once is rejected at
//! registration.

use portmeet_proto::valid_port;

use crate::error::BrokerError;

#[derive(Debug, Clone, Default)]
pub struct PortPolicy {
    whitelist: Vec<u16>,
    blacklist: Vec<u16>,
}

impl PortPolicy {
    pub fn new(whitelist: Vec<u16>, blacklist: Vec<u16>) -> Result<Self, BrokerError> {
        if !whitelist.is_empty() && !blacklist.is_empty() {
            return Err(BrokerError::SchemaInvalid(
                "a host may declare a port whitelist or a port blacklist, not both".into(),
            ));
        }
        if let Some(port) = whitelist
            .iter()
            .chain(blacklist.iter())
            .find(|p| !valid_port(**p))
        {
            return Err(BrokerError::SchemaInvalid(format!(
                "port {port} is outside the valid range"
            )));
        }
        Ok(Self {
            whitelist,
            blacklist,
        })
    }

    /// Whether a receiver may ask for `port` on this sender.
    pub fn permits(&self, port: u16) -> Result<(), BrokerError> {
        if !self.whitelist.is_empty() {
            if self.whitelist.contains(&port) {
                Ok(())
            } else {
                Err(BrokerError::PortDenied {
                    port,
                    rule: "whitelist",
                })
            }
        } else if self.blacklist.contains(&port) {
            Err(BrokerError::PortDenied {
                port,
                rule: "blacklist",
            })
        } else {
            Ok(())
        }
    }
}
