//! Pending approval round-trips
//!
//! A request to a sender without auto-accept waits here until the sender
//! answers. One FIFO queue per target socket: `connect_accept` and
//! `connect_deny` always resolve the oldest outstanding request, so
//! concurrent requests to the same sender cannot cross-trigger.

use std::collections::{HashMap, VecDeque};

use crate::client::ConnId;

/// One receiver waiting for a sender's answer.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub requester_uuid: String,
    pub requester_conn: ConnId,
    pub port: u16,
}

#[derive(Debug, Default)]
pub(crate) struct PendingApprovals {
    queues: HashMap<ConnId, VecDeque<PendingApproval>>,
}

impl PendingApprovals {
    pub(crate) fn push(&mut self, target: ConnId, approval: PendingApproval) {
        self.queues.entry(target).or_default().push_back(approval);
    }

    /// Oldest outstanding request for this target, if any.
    pub(crate) fn pop(&mut self, target: ConnId) -> Option<PendingApproval> {
        let queue = self.queues.get_mut(&target)?;
        let approval = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&target);
        }
        approval
    }

    /// Drop the whole queue of a disappearing target, yielding the waiters.
    pub(crate) fn drain_target(&mut self, target: ConnId) -> Vec<PendingApproval> {
        self.queues
            .remove(&target)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    /// Remove every entry a disappearing requester left behind.
    pub(crate) fn purge_requester(&mut self, requester: ConnId) {
        for queue in self.queues.values_mut() {
            queue.retain(|a| a.requester_conn != requester);
        }
        self.queues.retain(|_, q| !q.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approval(conn: ConnId, port: u16) -> PendingApproval {
        PendingApproval {
            requester_uuid: format!("client-{conn}"),
            requester_conn: conn,
            port,
        }
    }

    #[test]
    fn answers_resolve_in_fifo_order() {
        let mut pending = PendingApprovals::default();
        pending.push(1, approval(10, 80));
        pending.push(1, approval(11, 443));

        assert_eq!(pending.pop(1).unwrap().requester_conn, 10);
        assert_eq!(pending.pop(1).unwrap().requester_conn, 11);
        assert!(pending.pop(1).is_none());
    }

    #[test]
    fn queues_are_per_target() {
        let mut pending = PendingApprovals::default();
        pending.push(1, approval(10, 80));
        pending.push(2, approval(11, 80));

        assert_eq!(pending.pop(2).unwrap().requester_conn, 11);
        assert_eq!(pending.pop(1).unwrap().requester_conn, 10);
    }

    #[test]
    fn draining_a_target_yields_all_waiters() {
        let mut pending = PendingApprovals::default();
        pending.push(1, approval(10, 80));
        pending.push(1, approval(11, 443));

        let waiters = pending.drain_target(1);
        assert_eq!(waiters.len(), 2);
        assert!(pending.pop(1).is_none());
    }

    #[test]
    fn purging_a_requester_leaves_other_waiters() {
        let mut pending = PendingApprovals::default();
        pending.push(1, approval(10, 80));
        pending.push(1, approval(11, 443));
        pending.push(2, approval(10, 22));

        pending.purge_requester(10);

        assert_eq!(pending.pop(1).unwrap().requester_conn, 11);
        assert!(pending.pop(1).is_none());
        assert!(pending.pop(2).is_none());
    }
}
