//! Naming-conflict resolution.
//!
//! When the backend refuses a replayed operation with a naming-related
//! result code, the resolver computes how to rewrite the operation so that
//! a bounded number of retries converges on the same directory content
//! every replica ends up with. Identity is always the entry's unique id;
//! DNs are recomputed from it, never trusted across a conflict.

use std::sync::Arc;
use std::time::Duration;

use dirsync_proto::{
    ChangeNumber, ChangeNumberGenerator, Dn, Modification, ModificationType, OpKind, Rdn,
    ResultCode, UpdateMsg, UpdateOp,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::ReplicaBackend;
use crate::historical::{AttributeRegistry, EntryHistorical};
use crate::metrics;

/// What the driving loop should do with an operation after one failed
/// apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverOutcome {
    /// Apply this rewritten operation instead.
    Retry(UpdateMsg),
    /// The operation's effect is already in place (or is a legitimate
    /// no-op); commit it.
    Done,
    /// The conflict cannot be fixed automatically; commit the change number
    /// and leave the entry for out-of-band repair.
    Unresolved,
}

/// Per-context conflict resolver.
pub struct ConflictResolver {
    backend: Arc<dyn ReplicaBackend>,
    base_dn: Dn,
    generator: Arc<Mutex<ChangeNumberGenerator>>,
    registry: Arc<dyn AttributeRegistry>,
    purge_delay: Duration,
}

impl ConflictResolver {
    pub fn new(
        backend: Arc<dyn ReplicaBackend>,
        base_dn: Dn,
        generator: Arc<Mutex<ChangeNumberGenerator>>,
        registry: Arc<dyn AttributeRegistry>,
        purge_delay: Duration,
    ) -> Self {
        Self { backend, base_dn, generator, registry, purge_delay }
    }

    /// Dispatches one failed apply to the branch for its operation kind and
    /// result code.
    pub async fn resolve(&self, msg: &UpdateMsg, code: ResultCode) -> ResolverOutcome {
        debug!(csn = %msg.csn, dn = %msg.dn, kind = %msg.kind(), result = %code, "Resolving naming conflict");
        match (msg.kind(), code) {
            (OpKind::Add, ResultCode::NoSuchObject) => self.add_missing_parent(msg).await,
            (OpKind::Add, ResultCode::EntryAlreadyExists) => self.add_dn_taken(msg).await,
            (OpKind::Delete, ResultCode::NoSuchObject) => self.retarget_or_done(msg).await,
            (OpKind::Delete, ResultCode::NotAllowedOnNonLeaf) => {
                self.delete_nonleaf(msg).await
            }
            (OpKind::Modify, ResultCode::NoSuchObject) => self.retarget_or_done(msg).await,
            (OpKind::Modify, ResultCode::NotAllowedOnRdn) => self.modify_rdn_clash(msg),
            (
                OpKind::ModifyDn,
                ResultCode::NoSuchObject
                | ResultCode::UnwillingToPerform
                | ResultCode::ObjectclassViolation,
            ) => self.moddn_rebuild(msg).await,
            (OpKind::ModifyDn, ResultCode::EntryAlreadyExists) => {
                self.moddn_dn_taken(msg).await
            }
            (_, code) => {
                // Not a naming conflict. The change number still commits so
                // the replica keeps moving; the entry is left to a repair
                // tool.
                warn!(csn = %msg.csn, dn = %msg.dn, result = %code, "Replayed operation failed outside conflict resolution");
                metrics::record_naming_conflict(false);
                ResolverOutcome::Unresolved
            }
        }
    }

    /// ADD whose parent DN does not exist. The parent may have been renamed
    /// (relocate under its current DN) or deleted (keep the entry as a
    /// conflict child of the base).
    async fn add_missing_parent(&self, msg: &UpdateMsg) -> ResolverOutcome {
        let UpdateOp::Add { parent_uuid, .. } = &msg.op else {
            return ResolverOutcome::Unresolved;
        };
        let Some(rdn) = msg.dn.rdn().cloned() else {
            return ResolverOutcome::Unresolved;
        };
        let Some(parent_uuid) = parent_uuid else {
            // Base entry of the context; nothing to re-parent under.
            metrics::record_naming_conflict(false);
            return ResolverOutcome::Done;
        };
        match self.backend.find_by_uuid(*parent_uuid).await {
            Some(parent_dn) => {
                let target = parent_dn.child(rdn);
                info!(csn = %msg.csn, dn = %msg.dn, new_dn = %target, "Re-parenting add under renamed parent");
                metrics::record_naming_conflict(true);
                ResolverOutcome::Retry(retarget(msg, target))
            }
            None => {
                let conflict = self.base_dn.child(Rdn::conflict(&msg.entry_uuid, &rdn));
                warn!(csn = %msg.csn, dn = %msg.dn, new_dn = %conflict, "Parent deleted; keeping entry as conflict child of the base");
                metrics::record_naming_conflict(false);
                ResolverOutcome::Retry(conflict_add(msg, conflict))
            }
        }
    }

    /// ADD whose DN is already taken. By the same entry: replay is
    /// idempotent. By a different entry: both survive, the later one under
    /// the synthetic conflict RDN.
    async fn add_dn_taken(&self, msg: &UpdateMsg) -> ResolverOutcome {
        if self.backend.find_by_uuid(msg.entry_uuid).await.is_some() {
            metrics::record_naming_conflict(true);
            return ResolverOutcome::Done;
        }
        let Some(rdn) = msg.dn.rdn().cloned() else {
            return ResolverOutcome::Unresolved;
        };
        let conflict = msg.dn.with_rdn(Rdn::conflict(&msg.entry_uuid, &rdn));
        warn!(csn = %msg.csn, dn = %msg.dn, new_dn = %conflict, "DN taken by a different entry; keeping both");
        metrics::record_naming_conflict(false);
        ResolverOutcome::Retry(conflict_add(msg, conflict))
    }

    /// DELETE or MODIFY aimed at a DN the entry no longer carries. Chase
    /// the entry by unique id; if it is really gone the operation is a
    /// no-op.
    async fn retarget_or_done(&self, msg: &UpdateMsg) -> ResolverOutcome {
        match self.backend.find_by_uuid(msg.entry_uuid).await {
            Some(current) if current != msg.dn => {
                info!(csn = %msg.csn, dn = %msg.dn, new_dn = %current, "Retargeting operation at the entry's current DN");
                metrics::record_naming_conflict(true);
                ResolverOutcome::Retry(retarget(msg, current))
            }
            Some(_) | None => {
                metrics::record_naming_conflict(true);
                ResolverOutcome::Done
            }
        }
    }

    /// DELETE of an entry that concurrently acquired children. The children
    /// are preserved as conflict children of the base, then the delete is
    /// retried.
    async fn delete_nonleaf(&self, msg: &UpdateMsg) -> ResolverOutcome {
        let children = self.backend.children_of(&msg.dn).await;
        if children.is_empty() {
            return ResolverOutcome::Retry(msg.clone());
        }
        warn!(csn = %msg.csn, dn = %msg.dn, children = children.len(), "Deleting entry with concurrently added children; relocating them");
        metrics::record_naming_conflict(false);
        for (child_uuid, child_dn) in children {
            let Some(rdn) = child_dn.rdn().cloned() else { continue };
            let csn = self.generator.lock().new_csn();
            let rename = UpdateMsg {
                csn,
                entry_uuid: child_uuid,
                dn: child_dn.clone(),
                op: UpdateOp::ModifyDn {
                    new_rdn: Rdn::conflict(&child_uuid, &rdn),
                    new_superior: Some(self.base_dn.clone()),
                    new_superior_uuid: None,
                    delete_old_rdn: false,
                },
            };
            let code = self.backend.apply(&rename).await;
            if code.is_success() {
                self.backend.mark_conflict(child_uuid, &child_dn).await;
                self.record_child_moddn(child_uuid, csn).await;
            } else {
                warn!(child = %child_dn, result = %code, "Failed to relocate conflicting child");
            }
        }
        ResolverOutcome::Retry(msg.clone())
    }

    /// Stamps a resolver-driven rename into the child's persisted ledger so
    /// later MODRDN replays on the child resolve against accurate history.
    async fn record_child_moddn(&self, child_uuid: uuid::Uuid, csn: ChangeNumber) {
        let lines = self.backend.read_historical(child_uuid).await;
        let mut hist =
            EntryHistorical::decode(&lines, self.registry.as_ref(), self.purge_delay);
        hist.record_entry_moddn(csn);
        let (lines, _) = hist.encode(csn.timestamp_ms());
        self.backend.write_historical(child_uuid, lines).await;
    }

    /// MODIFY that would strip the value the entry's current RDN still
    /// names. The offending changes are rewritten to keep that value.
    fn modify_rdn_clash(&self, msg: &UpdateMsg) -> ResolverOutcome {
        let UpdateOp::Modify { mods } = &msg.op else {
            return ResolverOutcome::Unresolved;
        };
        let Some(rdn) = msg.dn.rdn() else {
            return ResolverOutcome::Unresolved;
        };
        let mods = mods.iter().cloned().map(|m| preserve_rdn_value(m, rdn)).collect();
        info!(csn = %msg.csn, dn = %msg.dn, "Rewriting modify to preserve the RDN value");
        metrics::record_naming_conflict(true);
        ResolverOutcome::Retry(UpdateMsg {
            op: UpdateOp::Modify { mods },
            ..msg.clone()
        })
    }

    /// MODRDN whose target or new superior moved. Both are rebuilt from
    /// their unique ids.
    async fn moddn_rebuild(&self, msg: &UpdateMsg) -> ResolverOutcome {
        let UpdateOp::ModifyDn { new_rdn, new_superior, new_superior_uuid, delete_old_rdn } =
            &msg.op
        else {
            return ResolverOutcome::Unresolved;
        };
        let Some(current_dn) = self.backend.find_by_uuid(msg.entry_uuid).await else {
            // Renaming a deleted entry is a no-op.
            metrics::record_naming_conflict(true);
            return ResolverOutcome::Done;
        };
        let superior = match new_superior_uuid {
            Some(uuid) => match self.backend.find_by_uuid(*uuid).await {
                Some(dn) => Some(dn),
                None => {
                    warn!(csn = %msg.csn, dn = %msg.dn, "New superior deleted; leaving entry in place as conflicting");
                    self.backend.mark_conflict(msg.entry_uuid, &msg.dn).await;
                    metrics::record_naming_conflict(false);
                    return ResolverOutcome::Done;
                }
            },
            None => new_superior.clone(),
        };
        let parent = superior.clone().or_else(|| current_dn.parent());
        if let Some(parent) = parent {
            if parent.child(new_rdn.clone()) == current_dn {
                // A previous replay already landed this rename.
                metrics::record_naming_conflict(true);
                return ResolverOutcome::Done;
            }
        }
        info!(csn = %msg.csn, dn = %msg.dn, new_dn = %current_dn, "Rebuilding rename from the entry's current DN");
        metrics::record_naming_conflict(true);
        ResolverOutcome::Retry(UpdateMsg {
            dn: current_dn,
            op: UpdateOp::ModifyDn {
                new_rdn: new_rdn.clone(),
                new_superior: superior,
                new_superior_uuid: *new_superior_uuid,
                delete_old_rdn: *delete_old_rdn,
            },
            ..msg.clone()
        })
    }

    /// MODRDN whose new DN is already taken; the renamed entry keeps its
    /// content under the synthetic conflict RDN.
    async fn moddn_dn_taken(&self, msg: &UpdateMsg) -> ResolverOutcome {
        let UpdateOp::ModifyDn { new_rdn, new_superior, new_superior_uuid, delete_old_rdn } =
            &msg.op
        else {
            return ResolverOutcome::Unresolved;
        };
        let conflict_rdn = Rdn::conflict(&msg.entry_uuid, new_rdn);
        warn!(csn = %msg.csn, dn = %msg.dn, new_rdn = %conflict_rdn, "Rename target taken; using conflict RDN");
        self.backend.mark_conflict(msg.entry_uuid, &msg.dn).await;
        metrics::record_naming_conflict(false);
        ResolverOutcome::Retry(UpdateMsg {
            op: UpdateOp::ModifyDn {
                new_rdn: conflict_rdn,
                new_superior: new_superior.clone(),
                new_superior_uuid: *new_superior_uuid,
                delete_old_rdn: *delete_old_rdn,
            },
            ..msg.clone()
        })
    }
}

/// Same operation, different target DN.
fn retarget(msg: &UpdateMsg, dn: Dn) -> UpdateMsg {
    UpdateMsg { dn, ..msg.clone() }
}

/// An ADD relocated to a conflict DN, tagged with the DN it originally
/// asked for.
fn conflict_add(msg: &UpdateMsg, dn: Dn) -> UpdateMsg {
    let mut rewritten = retarget(msg, dn);
    if let UpdateOp::Add { attrs, .. } = &mut rewritten.op {
        attrs.insert(
            crate::backend::memory::CONFLICT_ATTR.to_string(),
            vec![msg.dn.to_string()],
        );
    }
    rewritten
}

/// Rewrites one modification so it cannot strip `rdn`'s value.
fn preserve_rdn_value(m: Modification, rdn: &Rdn) -> Modification {
    let Some(rdn_value) = rdn.value_of(&m.attr) else { return m };
    match m.mod_type {
        ModificationType::Delete
            if m.values.is_empty() || m.values.iter().any(|v| v == rdn_value) =>
        {
            Modification {
                mod_type: ModificationType::Replace,
                values: vec![rdn_value.to_string()],
                ..m
            }
        }
        ModificationType::Replace if !m.values.iter().any(|v| v == rdn_value) => {
            let mut values = m.values.clone();
            values.push(rdn_value.to_string());
            Modification { mod_type: ModificationType::Replace, values, ..m }
        }
        _ => m,
    }
}
