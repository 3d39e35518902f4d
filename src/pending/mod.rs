//! Ordering and dependency gating for in-flight writes.
//!
//! Two trackers share the same discipline: changes are held in change-number
//! order, and only the contiguous committed prefix may advance the
//! `ServerState` or leave the replica. [`PendingChanges`] covers writes
//! originated locally; [`RemotePendingChanges`] covers inbound writes and
//! additionally defers operations whose causal dependencies have not been
//! applied yet.

mod local;
mod remote;

pub use local::PendingChanges;
pub use remote::RemotePendingChanges;

use dirsync_proto::{ChangeNumber, Dn, OpKind, ServerState, UpdateMsg};

/// Everything dependency analysis needs to know about one pending write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpSummary {
    pub kind: OpKind,
    pub dn: Dn,
    /// For a MODRDN, the DN the entry carries after the rename.
    pub new_dn: Option<Dn>,
}

impl OpSummary {
    /// Builds a summary from a full update message.
    #[must_use]
    pub fn of(msg: &UpdateMsg) -> Self {
        Self { kind: msg.kind(), dn: msg.dn.clone(), new_dn: msg.dn_after_rename() }
    }

    /// Convenience constructor for operations that never rename.
    #[must_use]
    pub fn new(kind: OpKind, dn: Dn) -> Self {
        Self { kind, dn, new_dn: None }
    }
}

/// One tracked write, ordered by its change number.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub csn: ChangeNumber,
    pub committed: bool,
    /// The outbound replication message (local writes: attached at commit;
    /// remote writes: the message as received).
    pub msg: Option<UpdateMsg>,
    pub op: OpSummary,
    /// Change numbers this write must wait for (remote writes only).
    pub dependency_state: Option<ServerState>,
}

impl PendingChange {
    fn new(csn: ChangeNumber, op: OpSummary) -> Self {
        Self { csn, committed: false, msg: None, op, dependency_state: None }
    }

    fn from_msg(msg: UpdateMsg) -> Self {
        let op = OpSummary::of(&msg);
        Self { csn: msg.csn, committed: false, msg: Some(msg), op, dependency_state: None }
    }
}

/// Returns `true` when `target` is `dn` itself or one of its descendants.
fn at_or_below(target: &Dn, dn: &Dn) -> bool {
    target == dn || target.is_descendant_of(dn)
}

/// Builds a minimal update message, used by tests across this module.
#[cfg(test)]
pub(crate) fn test_msg(
    csn: ChangeNumber,
    dn: &str,
    op: dirsync_proto::UpdateOp,
) -> UpdateMsg {
    UpdateMsg { csn, entry_uuid: uuid::Uuid::new_v4(), dn: dn.parse().unwrap(), op }
}
