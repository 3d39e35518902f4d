//! Tracker for locally originated writes.

use std::collections::BTreeMap;

use dirsync_proto::{ChangeNumber, ChangeNumberGenerator, ServerState, UpdateMsg};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{OpSummary, PendingChange};

/// Locally originated writes between change-number allocation and outbound
/// forwarding.
///
/// Invariant: only the contiguous prefix of committed entries, in
/// change-number order, ever advances `ServerState` or reaches the
/// transport. A later write that commits first waits behind an earlier one
/// still in flight, so the advertised state and the wire order never run
/// ahead of what has actually been applied.
#[derive(Debug, Default)]
pub struct PendingChanges {
    changes: BTreeMap<ChangeNumber, PendingChange>,
}

impl PendingChanges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a change number for a new local write and records it as
    /// uncommitted.
    pub fn put_local_change(
        &mut self,
        generator: &mut ChangeNumberGenerator,
        op: OpSummary,
    ) -> ChangeNumber {
        let csn = generator.new_csn();
        trace!(csn = %csn, dn = %op.dn, kind = %op.kind, "Recording local change");
        self.changes.insert(csn, PendingChange::new(csn, op));
        csn
    }

    /// Marks a write committed and attaches its outbound message.
    ///
    /// The message is built only after the local apply succeeded, so the
    /// state it carries reflects the committed effect. Returns `false` for
    /// an unknown change number.
    pub fn commit(&mut self, csn: ChangeNumber, msg: UpdateMsg) -> bool {
        match self.changes.get_mut(&csn) {
            Some(change) => {
                change.committed = true;
                change.msg = Some(msg);
                true
            }
            None => false,
        }
    }

    /// Drops an uncommitted write whose local apply failed; the caller owns
    /// the retry.
    pub fn abort(&mut self, csn: ChangeNumber) -> bool {
        self.changes.remove(&csn).is_some()
    }

    /// Drains the contiguous committed prefix: advances `state`, forwards
    /// each outbound message, removes the entry. Stops at the first
    /// uncommitted change. Returns how many were pushed.
    ///
    /// A send failure leaves the entry committed-but-queued so a later flush
    /// can retry once the transport recovers.
    pub fn push_committed_changes(
        &mut self,
        state: &mut ServerState,
        outbound: &mpsc::UnboundedSender<UpdateMsg>,
    ) -> usize {
        let mut pushed = 0;
        while let Some(entry) = self.changes.first_entry() {
            if !entry.get().committed {
                break;
            }
            let change = entry.get();
            let Some(msg) = change.msg.clone() else {
                // Committed entries always carry a message; treat a bare one
                // as state-only.
                let csn = change.csn;
                state.update(csn);
                entry.remove();
                pushed += 1;
                continue;
            };
            if outbound.send(msg).is_err() {
                debug!(csn = %change.csn, "Outbound channel closed; keeping committed change queued");
                break;
            }
            state.update(change.csn);
            entry.remove();
            pushed += 1;
        }
        pushed
    }

    /// Number of tracked writes, committed or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::test_msg;
    use dirsync_proto::{OpKind, UpdateOp};

    fn summary(dn: &str) -> OpSummary {
        OpSummary::new(OpKind::Modify, dn.parse().unwrap())
    }

    #[test]
    fn test_put_allocates_increasing_csns() {
        let mut generator = ChangeNumberGenerator::new(1);
        let mut pending = PendingChanges::new();
        let a = pending.put_local_change(&mut generator, summary("cn=a,ou=people"));
        let b = pending.put_local_change(&mut generator, summary("cn=b,ou=people"));
        assert!(b.newer(&a));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_commit_unknown_csn_is_rejected() {
        let mut pending = PendingChanges::new();
        let csn = ChangeNumber::new(1, 0, 1);
        assert!(!pending.commit(csn, test_msg(csn, "cn=a", UpdateOp::Delete)));
    }

    #[test]
    fn test_push_stops_at_first_uncommitted() {
        let mut generator = ChangeNumberGenerator::new(1);
        let mut pending = PendingChanges::new();
        let mut state = ServerState::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first = pending.put_local_change(&mut generator, summary("cn=a,ou=people"));
        let second = pending.put_local_change(&mut generator, summary("cn=b,ou=people"));

        // The later change commits first; nothing may be forwarded yet.
        assert!(pending.commit(second, test_msg(second, "cn=b,ou=people", UpdateOp::Delete)));
        assert_eq!(pending.push_committed_changes(&mut state, &tx), 0);
        assert!(rx.try_recv().is_err());
        assert!(state.max_csn(1).is_none());

        // Once the earlier change commits, both drain in csn order.
        assert!(pending.commit(first, test_msg(first, "cn=a,ou=people", UpdateOp::Delete)));
        assert_eq!(pending.push_committed_changes(&mut state, &tx), 2);
        assert_eq!(rx.try_recv().unwrap().csn, first);
        assert_eq!(rx.try_recv().unwrap().csn, second);
        assert_eq!(state.max_csn(1), Some(second));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_abort_unblocks_later_changes() {
        let mut generator = ChangeNumberGenerator::new(1);
        let mut pending = PendingChanges::new();
        let mut state = ServerState::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let first = pending.put_local_change(&mut generator, summary("cn=a,ou=people"));
        let second = pending.put_local_change(&mut generator, summary("cn=b,ou=people"));
        pending.commit(second, test_msg(second, "cn=b,ou=people", UpdateOp::Delete));

        assert!(pending.abort(first));
        assert_eq!(pending.push_committed_changes(&mut state, &tx), 1);
        assert_eq!(state.max_csn(1), Some(second));
    }

    #[test]
    fn test_closed_channel_keeps_change_queued() {
        let mut generator = ChangeNumberGenerator::new(1);
        let mut pending = PendingChanges::new();
        let mut state = ServerState::new();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let csn = pending.put_local_change(&mut generator, summary("cn=a,ou=people"));
        pending.commit(csn, test_msg(csn, "cn=a,ou=people", UpdateOp::Delete));
        assert_eq!(pending.push_committed_changes(&mut state, &tx), 0);
        assert_eq!(pending.len(), 1);
        assert!(state.max_csn(1).is_none());
    }
}
