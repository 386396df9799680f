//! The guarded control plane
//!
//! Client registry, tunnel registry, port allocator, and pending approvals
//! live behind one mutex. Every externally visible operation is compound:
//! registration replaces sockets atomically with lookups, allocation inserts
//! the reserving record in the same step, and teardown collects everything
//! the caller must kill or notify before the lock is released.
//!
//! Nothing here awaits; callers do their spawning, probing, and killing
//! outside the lock.

use std::collections::HashMap;
use std::sync::Mutex;

use portmeet_proto::SignalMessage;
use portmeet_sshd::TunnelHandle;
use tracing::{debug, info, warn};

use crate::client::{ConnId, RegisteredClient};
use crate::error::BrokerError;
use crate::pending::{PendingApproval, PendingApprovals};

/// One live (or being-provisioned) tunnel.
///
/// The record is inserted with `handle: None` when its port pair is
/// allocated, so concurrent allocations already see the reservation; the
/// handle is attached once the child is up.
#[derive(Debug)]
struct TunnelRecord {
    sender_uuid: String,
    receiver_uuid: String,
    sshd_port: u16,
    local_port: u16,
    handle: Option<TunnelHandle>,
}

/// A tunnel taken out of the registry, with everything teardown needs.
#[derive(Debug)]
pub struct ReapedTunnel {
    pub sshd_port: u16,
    pub local_port: u16,
    /// `None` for a reservation whose child never came up.
    pub handle: Option<TunnelHandle>,
    /// Peers that should hear `tunnel_close`; already excludes whoever
    /// triggered the reap.
    pub survivors: Vec<RegisteredClient>,
}

/// Everything a socket close leaves behind.
#[derive(Debug, Default)]
pub struct DisconnectReport {
    pub client: Option<RegisteredClient>,
    pub tunnels: Vec<ReapedTunnel>,
    /// Receivers whose approval round-trip died with the target.
    pub orphaned_requesters: Vec<RegisteredClient>,
}

/// Where a `connect_to_host` goes after validation.
#[derive(Debug)]
pub enum ConnectRoute {
    /// Target auto-accepts; provision immediately.
    Provision {
        sender: RegisteredClient,
        receiver: RegisteredClient,
    },
    /// Target must confirm; the request is queued and the caller sends
    /// `connect_confirm` to the sender.
    AwaitApproval {
        sender: RegisteredClient,
        source_client: String,
    },
}

struct PlaneInner {
    clients: HashMap<String, RegisteredClient>,
    tunnels: Vec<TunnelRecord>,
    pending: PendingApprovals,
    sshd_ports: Vec<u16>,
}

pub struct ControlPlane {
    inner: Mutex<PlaneInner>,
}

impl ControlPlane {
    /// `sshd_ports` is the configured candidate set; local ports are handed
    /// out strictly above it.
    pub fn new(sshd_ports: Vec<u16>) -> Self {
        let mut deduped: Vec<u16> = Vec::with_capacity(sshd_ports.len());
        for port in sshd_ports {
            if !deduped.contains(&port) {
                deduped.push(port);
            }
        }
        Self {
            inner: Mutex::new(PlaneInner {
                clients: HashMap::new(),
                tunnels: Vec::new(),
                pending: PendingApprovals::default(),
                sshd_ports: deduped,
            }),
        }
    }

    /// Register a new agent or re-register an existing one.
    ///
    /// A repeat uuid reuses the slot, replacing its socket and policy
    /// fields. A socket that was previously bound to a different uuid drops
    /// that binding first; any tunnels it owned come back for teardown.
    pub fn register(&self, client: RegisteredClient) -> RegisterOutcome {
        let mut inner = self.inner.lock().unwrap();

        let mut displaced = Vec::new();
        let stale_uuid = inner
            .clients
            .values()
            .find(|c| c.conn_id == client.conn_id && c.uuid != client.uuid)
            .map(|c| c.uuid.clone());
        if let Some(stale_uuid) = stale_uuid {
            warn!(
                old = %stale_uuid,
                new = %client.uuid,
                "socket re-registered under a different uuid, dropping old binding"
            );
            inner.clients.remove(&stale_uuid);
            displaced = inner.reap_tunnels_of(&stale_uuid);
            inner.pending.purge_requester(client.conn_id);
        }

        let replaced = inner.clients.insert(client.uuid.clone(), client.clone());
        match replaced {
            Some(ref old) => info!(
                uuid = %client.uuid,
                client_type = ?client.client_type,
                old_connected_at = %old.connected_at,
                "re-registered agent (replaced previous socket)"
            ),
            None => info!(
                uuid = %client.uuid,
                client_type = ?client.client_type,
                "registered new agent"
            ),
        }

        RegisterOutcome {
            replaced: replaced.is_some(),
            displaced,
        }
    }

    /// The agent currently bound to this socket.
    pub fn client_by_conn(&self, conn: ConnId) -> Option<RegisteredClient> {
        let inner = self.inner.lock().unwrap();
        inner
            .clients
            .values()
            .find(|c| c.conn_id == conn)
            .cloned()
    }

    /// Validate a `connect_to_host` and decide its route, queueing the
    /// approval when the target wants one.
    pub fn route_connect(
        &self,
        requester_conn: ConnId,
        target_prefix: &str,
        port: u16,
    ) -> Result<ConnectRoute, BrokerError> {
        let mut inner = self.inner.lock().unwrap();

        let requester = inner
            .clients
            .values()
            .find(|c| c.conn_id == requester_conn)
            .cloned()
            .ok_or(BrokerError::NotRegistered)?;
        if requester.client_type != portmeet_proto::ClientType::Receiver {
            return Err(BrokerError::NotReceiver);
        }

        let mut matches = inner.clients.values().filter(|c| {
            c.client_type == portmeet_proto::ClientType::Sender && c.uuid.starts_with(target_prefix)
        });
        let sender = match (matches.next(), matches.next()) {
            (None, _) => return Err(BrokerError::TargetNotFound(target_prefix.into())),
            (Some(_), Some(_)) => {
                return Err(BrokerError::TargetAmbiguous(target_prefix.into()))
            }
            (Some(sender), None) => sender.clone(),
        };

        sender.policy.permits(port)?;

        if sender.auto_accept {
            Ok(ConnectRoute::Provision {
                sender,
                receiver: requester,
            })
        } else {
            inner.pending.push(
                sender.conn_id,
                PendingApproval {
                    requester_uuid: requester.uuid.clone(),
                    requester_conn,
                    port,
                },
            );
            Ok(ConnectRoute::AwaitApproval {
                sender,
                source_client: requester.uuid,
            })
        }
    }

    /// Oldest request still waiting on this target socket.
    pub fn take_pending(&self, target_conn: ConnId) -> Option<PendingApproval> {
        self.inner.lock().unwrap().pending.pop(target_conn)
    }

    /// Reserve a port pair and insert the tunnel record in one step.
    ///
    /// The sshd port is the first configured candidate no live record
    /// holds; the local port starts just above the candidate set and skips
    /// collisions.
    pub fn allocate_and_insert(
        &self,
        sender_uuid: &str,
        receiver_uuid: &str,
    ) -> Result<(u16, u16), BrokerError> {
        let mut inner = self.inner.lock().unwrap();

        let sshd_port = inner
            .sshd_ports
            .iter()
            .copied()
            .find(|p| !inner.tunnels.iter().any(|t| t.sshd_port == *p))
            .ok_or(BrokerError::ServerFull)?;

        let base = inner
            .sshd_ports
            .iter()
            .copied()
            .max()
            .ok_or(BrokerError::ServerFull)?;
        let mut local_port = base + 1;
        while inner.tunnels.iter().any(|t| t.local_port == local_port) {
            local_port += 1;
        }

        inner.tunnels.push(TunnelRecord {
            sender_uuid: sender_uuid.into(),
            receiver_uuid: receiver_uuid.into(),
            sshd_port,
            local_port,
            handle: None,
        });
        debug!(sshd_port, local_port, "reserved port pair");

        Ok((sshd_port, local_port))
    }

    /// Attach the spawned child to its reservation and announce the tunnel
    /// to both peers, receiver first.
    ///
    /// Announcing under the lock keeps the pair of `tunnel_connect`
    /// messages atomic with the registry update; a reaper running later can
    /// only ever see a fully announced tunnel.
    pub fn attach_and_announce(
        &self,
        sshd_port: u16,
        handle: TunnelHandle,
        user: &str,
        forwarded_port: u16,
    ) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();

        let Some(idx) = inner
            .tunnels
            .iter()
            .position(|t| t.sshd_port == sshd_port && t.handle.is_none())
        else {
            // Reservation vanished: a peer disconnected while the child was
            // starting. Dropping the handle tears the child down.
            drop(handle);
            return Err(BrokerError::TargetDisconnected);
        };

        let sender_uuid = inner.tunnels[idx].sender_uuid.clone();
        let receiver_uuid = inner.tunnels[idx].receiver_uuid.clone();
        let local_port = inner.tunnels[idx].local_port;
        let (Some(sender), Some(receiver)) = (
            inner.clients.get(&sender_uuid).cloned(),
            inner.clients.get(&receiver_uuid).cloned(),
        ) else {
            inner.tunnels.remove(idx);
            drop(handle);
            return Err(BrokerError::TargetDisconnected);
        };

        inner.tunnels[idx].handle = Some(handle);

        receiver.send(SignalMessage::TunnelConnect {
            client_type: portmeet_proto::ClientType::Receiver,
            user: user.into(),
            sshd_port,
            local_port,
            forwarded_port: 0,
        });
        sender.send(SignalMessage::TunnelConnect {
            client_type: portmeet_proto::ClientType::Sender,
            user: user.into(),
            sshd_port,
            local_port,
            forwarded_port,
        });

        info!(
            sender = %sender_uuid,
            receiver = %receiver_uuid,
            sshd_port,
            local_port,
            forwarded_port,
            "tunnel established"
        );
        Ok(())
    }

    /// Drop a reservation whose child never came up, freeing its ports.
    pub fn abort_reservation(&self, sshd_port: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tunnels
            .retain(|t| !(t.sshd_port == sshd_port && t.handle.is_none()));
    }

    /// Handle a socket close: detach the client, reap its tunnels, cancel
    /// its approval round-trips.
    pub fn disconnect(&self, conn: ConnId) -> DisconnectReport {
        let mut inner = self.inner.lock().unwrap();

        let uuid = inner
            .clients
            .values()
            .find(|c| c.conn_id == conn)
            .map(|c| c.uuid.clone());
        let Some(uuid) = uuid else {
            // Never registered, or already replaced by a newer socket.
            inner.pending.purge_requester(conn);
            return DisconnectReport::default();
        };

        let client = inner.clients.remove(&uuid);
        let tunnels = inner.reap_tunnels_of(&uuid);

        let drained = inner.pending.drain_target(conn);
        let orphaned_requesters = drained
            .into_iter()
            .filter_map(|a| {
                inner
                    .clients
                    .values()
                    .find(|c| c.conn_id == a.requester_conn)
                    .cloned()
            })
            .collect();
        inner.pending.purge_requester(conn);

        info!(uuid = %uuid, reaped_tunnels = tunnels.len(), "agent disconnected");
        DisconnectReport {
            client,
            tunnels,
            orphaned_requesters,
        }
    }

    /// Reap the tunnel whose child died; both peers survive it.
    pub fn reap_sshd_port(&self, sshd_port: u16) -> Option<ReapedTunnel> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.tunnels.iter().position(|t| t.sshd_port == sshd_port)?;
        let record = inner.tunnels.remove(idx);

        let survivors = [&record.sender_uuid, &record.receiver_uuid]
            .into_iter()
            .filter_map(|uuid| inner.clients.get(uuid).cloned())
            .collect();
        Some(ReapedTunnel {
            sshd_port: record.sshd_port,
            local_port: record.local_port,
            handle: record.handle,
            survivors,
        })
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }

    pub fn tunnel_count(&self) -> usize {
        self.inner.lock().unwrap().tunnels.len()
    }
}

/// What a `register` did.
#[derive(Debug)]
pub struct RegisterOutcome {
    /// An existing uuid's slot was reused.
    pub replaced: bool,
    /// Tunnels owned by a binding this socket abandoned.
    pub displaced: Vec<ReapedTunnel>,
}

impl PlaneInner {
    /// Remove every tunnel `uuid` participates in. Survivors are resolved
    /// against the current client map, so a client removed beforehand is
    /// naturally excluded.
    fn reap_tunnels_of(&mut self, uuid: &str) -> Vec<ReapedTunnel> {
        let mut reaped = Vec::new();
        let mut idx = 0;
        while idx < self.tunnels.len() {
            if self.tunnels[idx].sender_uuid == uuid || self.tunnels[idx].receiver_uuid == uuid {
                let record = self.tunnels.remove(idx);
                let other = if record.sender_uuid == uuid {
                    &record.receiver_uuid
                } else {
                    &record.sender_uuid
                };
                let survivors = self.clients.get(other).cloned().into_iter().collect();
                reaped.push(ReapedTunnel {
                    sshd_port: record.sshd_port,
                    local_port: record.local_port,
                    handle: record.handle,
                    survivors,
                });
            } else {
                idx += 1;
            }
        }
        reaped
    }
}
