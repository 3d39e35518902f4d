//! Tracker for inbound (remote) writes.

use std::collections::{BTreeMap, BTreeSet};

use dirsync_proto::{ChangeNumber, OpKind, ServerState, UpdateMsg};
use tracing::{debug, trace};

use super::{at_or_below, PendingChange};

/// Inbound writes between receipt and durable application.
///
/// Ordering follows the same contiguous-committed-prefix rule as the local
/// tracker. On top of that, an operation may depend on an older pending
/// operation it cannot be applied before (an ADD under a parent whose own
/// ADD has not landed yet, and so on); such operations are parked and
/// released by [`get_next_update`](Self::get_next_update) once the
/// aggregate `ServerState` covers everything they recorded as a
/// prerequisite.
#[derive(Debug, Default)]
pub struct RemotePendingChanges {
    changes: BTreeMap<ChangeNumber, PendingChange>,
    /// Change numbers parked on unmet dependencies, in csn (FIFO) order.
    dependent: BTreeSet<ChangeNumber>,
}

impl RemotePendingChanges {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an inbound write keyed by its carried change number.
    ///
    /// The caller adjusts the local generator; this tracker only orders.
    pub fn put_remote_update(&mut self, msg: UpdateMsg) {
        trace!(csn = %msg.csn, dn = %msg.dn, kind = %msg.kind(), "Recording remote update");
        self.changes.insert(msg.csn, PendingChange::from_msg(msg));
    }

    /// Marks a replayed write as durably applied.
    pub fn commit(&mut self, csn: ChangeNumber) -> bool {
        match self.changes.get_mut(&csn) {
            Some(change) => {
                change.committed = true;
                true
            }
            None => false,
        }
    }

    /// Drains the contiguous committed prefix into `state`; returns the
    /// number of entries retired.
    pub fn push_committed_changes(&mut self, state: &mut ServerState) -> usize {
        let mut pushed = 0;
        while let Some(entry) = self.changes.first_entry() {
            if !entry.get().committed {
                break;
            }
            let csn = entry.get().csn;
            state.update(csn);
            self.dependent.remove(&csn);
            entry.remove();
            pushed += 1;
        }
        pushed
    }

    /// Detects whether `msg` depends on a strictly older pending operation
    /// on the same target family, per the dependency table.
    ///
    /// Each blocking operation's change number is recorded in the dependent
    /// entry's partial `ServerState`; the entry is then parked until
    /// [`get_next_update`](Self::get_next_update) observes coverage.
    /// Returns `true` when at least one dependency was found.
    pub fn check_dependencies(&mut self, msg: &UpdateMsg) -> bool {
        let new = super::OpSummary::of(msg);
        let mut blockers: Vec<ChangeNumber> = Vec::new();

        for (csn, existing) in self.changes.range(..msg.csn) {
            if existing.committed {
                continue;
            }
            let e = &existing.op;
            let blocked = match new.kind {
                OpKind::Add => {
                    let parent = new.dn.parent();
                    let touches = |dn: &dirsync_proto::Dn| {
                        *dn == new.dn || parent.as_ref() == Some(dn)
                    };
                    match e.kind {
                        OpKind::Delete => e.dn == new.dn,
                        OpKind::Add => e.dn.is_ancestor_of(&new.dn),
                        OpKind::ModifyDn => {
                            touches(&e.dn) || e.new_dn.as_ref().is_some_and(touches)
                        }
                        OpKind::Modify => false,
                    }
                }
                OpKind::Modify => e.kind == OpKind::Add && e.dn == new.dn,
                OpKind::Delete => match e.kind {
                    OpKind::Delete => at_or_below(&e.dn, &new.dn),
                    OpKind::ModifyDn => {
                        at_or_below(&e.dn, &new.dn)
                            || e.new_dn.as_ref().is_some_and(|d| at_or_below(d, &new.dn))
                    }
                    OpKind::Add => e.dn == new.dn,
                    OpKind::Modify => false,
                },
                OpKind::ModifyDn => {
                    let new_dn = new.new_dn.as_ref();
                    match e.kind {
                        OpKind::Delete => new_dn == Some(&e.dn),
                        OpKind::Add => {
                            new_dn == Some(&e.dn)
                                || new_dn
                                    .and_then(|d| d.parent())
                                    .is_some_and(|p| p == e.dn)
                                || e.dn == new.dn
                        }
                        OpKind::ModifyDn => e.new_dn.as_ref() == Some(&new.dn),
                        OpKind::Modify => false,
                    }
                }
            };
            if blocked {
                blockers.push(*csn);
            }
        }

        if blockers.is_empty() {
            return false;
        }
        if let Some(change) = self.changes.get_mut(&msg.csn) {
            let deps = change.dependency_state.get_or_insert_with(ServerState::new);
            for csn in &blockers {
                deps.update(*csn);
            }
            self.dependent.insert(msg.csn);
            debug!(
                csn = %msg.csn,
                blockers = blockers.len(),
                "Remote update parked on unmet dependencies"
            );
        }
        true
    }

    /// Releases the first parked operation whose recorded dependencies are
    /// covered by `state`, preserving FIFO order among released entries.
    pub fn get_next_update(&mut self, state: &ServerState) -> Option<UpdateMsg> {
        let csn = self.dependent.iter().copied().find(|csn| {
            self.changes
                .get(csn)
                .and_then(|c| c.dependency_state.as_ref())
                .is_none_or(|deps| state.covers(deps))
        })?;
        self.dependent.remove(&csn);
        self.changes.get(&csn).and_then(|c| c.msg.clone())
    }

    /// Number of tracked inbound writes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of writes currently parked on dependencies.
    #[must_use]
    pub fn dependent_len(&self) -> usize {
        self.dependent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::test_msg;
    use dirsync_proto::{Rdn, UpdateOp};
    use std::collections::BTreeMap as Map;

    fn csn(ts: u64) -> ChangeNumber {
        ChangeNumber::new(ts, 0, 2)
    }

    fn add(ts: u64, dn: &str) -> UpdateMsg {
        test_msg(csn(ts), dn, UpdateOp::Add { parent_uuid: None, attrs: Map::new() })
    }

    fn delete(ts: u64, dn: &str) -> UpdateMsg {
        test_msg(csn(ts), dn, UpdateOp::Delete)
    }

    fn modify(ts: u64, dn: &str) -> UpdateMsg {
        test_msg(csn(ts), dn, UpdateOp::Modify { mods: Vec::new() })
    }

    fn moddn(ts: u64, dn: &str, new_rdn: &str, new_superior: Option<&str>) -> UpdateMsg {
        test_msg(
            csn(ts),
            dn,
            UpdateOp::ModifyDn {
                new_rdn: new_rdn.parse::<Rdn>().unwrap(),
                new_superior: new_superior.map(|s| s.parse().unwrap()),
                new_superior_uuid: None,
                delete_old_rdn: true,
            },
        )
    }

    #[test]
    fn test_add_depends_on_parent_add() {
        let mut pending = RemotePendingChanges::new();
        let parent = add(10, "ou=people,dc=example");
        let child = add(20, "cn=x,ou=people,dc=example");
        pending.put_remote_update(parent.clone());
        pending.put_remote_update(child.clone());

        assert!(pending.check_dependencies(&child));
        assert_eq!(pending.dependent_len(), 1);

        // Not released until the parent's csn is covered.
        let mut state = ServerState::new();
        assert!(pending.get_next_update(&state).is_none());

        pending.commit(parent.csn);
        pending.push_committed_changes(&mut state);
        let released = pending.get_next_update(&state).unwrap();
        assert_eq!(released.csn, child.csn);
    }

    #[test]
    fn test_add_depends_on_delete_of_same_dn() {
        let mut pending = RemotePendingChanges::new();
        let del = delete(10, "cn=x,ou=people");
        let re_add = add(20, "cn=x,ou=people");
        pending.put_remote_update(del);
        pending.put_remote_update(re_add.clone());
        assert!(pending.check_dependencies(&re_add));
    }

    #[test]
    fn test_add_depends_on_rename_creating_its_parent() {
        let mut pending = RemotePendingChanges::new();
        let rename = moddn(10, "ou=people,dc=example", "ou=staff", None);
        let under_new = add(20, "cn=x,ou=staff,dc=example");
        pending.put_remote_update(rename);
        pending.put_remote_update(under_new.clone());
        assert!(pending.check_dependencies(&under_new));
    }

    #[test]
    fn test_modify_depends_on_add_of_same_dn() {
        let mut pending = RemotePendingChanges::new();
        let creation = add(10, "cn=x,ou=people");
        let m = modify(20, "cn=x,ou=people");
        pending.put_remote_update(creation);
        pending.put_remote_update(m.clone());
        assert!(pending.check_dependencies(&m));

        let unrelated = modify(30, "cn=y,ou=people");
        pending.put_remote_update(unrelated.clone());
        assert!(!pending.check_dependencies(&unrelated));
    }

    #[test]
    fn test_delete_depends_on_descendant_operations() {
        let mut pending = RemotePendingChanges::new();
        let child_del = delete(10, "cn=x,ou=people,dc=example");
        let subtree_del = delete(20, "ou=people,dc=example");
        pending.put_remote_update(child_del);
        pending.put_remote_update(subtree_del.clone());
        assert!(pending.check_dependencies(&subtree_del));
    }

    #[test]
    fn test_moddn_depends_on_delete_of_target_new_dn() {
        let mut pending = RemotePendingChanges::new();
        let blocking = delete(10, "cn=y,ou=people");
        let rename = moddn(20, "cn=x,ou=people", "cn=y", None);
        pending.put_remote_update(blocking);
        pending.put_remote_update(rename.clone());
        assert!(pending.check_dependencies(&rename));
    }

    #[test]
    fn test_moddn_chain_dependency() {
        let mut pending = RemotePendingChanges::new();
        // First rename produces the DN the second rename starts from.
        let first = moddn(10, "cn=a,ou=people", "cn=b", None);
        let second = moddn(20, "cn=b,ou=people", "cn=c", None);
        pending.put_remote_update(first);
        pending.put_remote_update(second.clone());
        assert!(pending.check_dependencies(&second));
    }

    #[test]
    fn test_dependencies_ignore_newer_entries() {
        let mut pending = RemotePendingChanges::new();
        let older = add(10, "cn=x,ou=people");
        let newer = add(20, "ou=people");
        pending.put_remote_update(older.clone());
        pending.put_remote_update(newer);
        // The parent ADD is newer, so it is not a dependency of the child.
        assert!(!pending.check_dependencies(&older));
    }

    #[test]
    fn test_release_is_fifo_among_ready_entries() {
        let mut pending = RemotePendingChanges::new();
        let parent = add(10, "ou=people,dc=example");
        let child_a = add(20, "cn=a,ou=people,dc=example");
        let child_b = add(30, "cn=b,ou=people,dc=example");
        pending.put_remote_update(parent.clone());
        pending.put_remote_update(child_a.clone());
        pending.put_remote_update(child_b.clone());
        assert!(pending.check_dependencies(&child_a));
        assert!(pending.check_dependencies(&child_b));

        let mut state = ServerState::new();
        pending.commit(parent.csn);
        pending.push_committed_changes(&mut state);

        assert_eq!(pending.get_next_update(&state).unwrap().csn, child_a.csn);
        assert_eq!(pending.get_next_update(&state).unwrap().csn, child_b.csn);
        assert!(pending.get_next_update(&state).is_none());
    }

    #[test]
    fn test_prefix_rule_holds_for_remote_commits() {
        let mut pending = RemotePendingChanges::new();
        let first = delete(10, "cn=a,ou=people");
        let second = delete(20, "cn=b,ou=people");
        pending.put_remote_update(first.clone());
        pending.put_remote_update(second.clone());

        let mut state = ServerState::new();
        pending.commit(second.csn);
        assert_eq!(pending.push_committed_changes(&mut state), 0);
        assert!(state.is_empty());

        pending.commit(first.csn);
        assert_eq!(pending.push_committed_changes(&mut state), 2);
        assert!(state.cover(&second.csn));
        assert!(pending.is_empty());
    }
}
