//! In-memory reference backend.
//!
//! Implements the exact result-code semantics the conflict resolver
//! dispatches on (parent existence, DN uniqueness, leaf checks, RDN value
//! preservation), which makes it the substrate for the integration tests
//! and good enough for embedding in tooling.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use dirsync_proto::{
    Dn, Modification, ModificationType, ResultCode, UpdateMsg, UpdateOp,
};
use tracing::trace;
use uuid::Uuid;

use super::ReplicaBackend;

/// Attribute recording the originally requested DN on conflict survivors.
pub const CONFLICT_ATTR: &str = "ds-sync-conflict";

#[derive(Debug, Clone)]
struct StoredEntry {
    dn: Dn,
    attrs: BTreeMap<String, Vec<String>>,
    historical: Vec<String>,
}

/// Dashmap-backed directory store.
///
/// The base entry exists from construction so the first replicated ADD has
/// a parent to land under.
#[derive(Debug)]
pub struct MemoryBackend {
    base_dn: Dn,
    base_uuid: Uuid,
    entries: DashMap<Uuid, StoredEntry>,
    by_dn: DashMap<String, Uuid>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(base_dn: Dn) -> Self {
        let base_uuid = Uuid::new_v4();
        let entries = DashMap::new();
        let by_dn = DashMap::new();
        entries.insert(
            base_uuid,
            StoredEntry { dn: base_dn.clone(), attrs: BTreeMap::new(), historical: Vec::new() },
        );
        by_dn.insert(base_dn.to_string(), base_uuid);
        Self { base_dn, base_uuid, entries, by_dn }
    }

    /// Unique id of the implicit base entry.
    #[must_use]
    pub fn base_uuid(&self) -> Uuid {
        self.base_uuid
    }

    #[must_use]
    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    /// Number of entries, the base included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current values of one attribute, for assertions in tests and tools.
    #[must_use]
    pub fn attr_values(&self, uuid: Uuid, attr: &str) -> Option<Vec<String>> {
        let attr = attr.to_ascii_lowercase();
        self.entries.get(&uuid).and_then(|e| e.attrs.get(&attr).cloned())
    }

    /// Whether the entry carries the conflict marker.
    #[must_use]
    pub fn is_conflict_marked(&self, uuid: Uuid) -> bool {
        self.entries
            .get(&uuid)
            .is_some_and(|e| e.attrs.contains_key(CONFLICT_ATTR))
    }

    fn dn_exists(&self, dn: &Dn) -> bool {
        self.by_dn.contains_key(&dn.to_string())
    }

    fn apply_add(
        &self,
        uuid: Uuid,
        dn: &Dn,
        attrs: &BTreeMap<String, Vec<String>>,
    ) -> ResultCode {
        if self.dn_exists(dn) {
            return ResultCode::EntryAlreadyExists;
        }
        match dn.parent() {
            Some(parent) if self.dn_exists(&parent) => {}
            _ => return ResultCode::NoSuchObject,
        }
        let attrs = attrs
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        self.entries.insert(
            uuid,
            StoredEntry { dn: dn.clone(), attrs, historical: Vec::new() },
        );
        self.by_dn.insert(dn.to_string(), uuid);
        ResultCode::Success
    }

    fn apply_delete(&self, dn: &Dn) -> ResultCode {
        let Some(uuid) = self.by_dn.get(&dn.to_string()).map(|e| *e) else {
            return ResultCode::NoSuchObject;
        };
        let has_children = self
            .entries
            .iter()
            .any(|e| e.value().dn.parent().as_ref() == Some(dn));
        if has_children {
            return ResultCode::NotAllowedOnNonLeaf;
        }
        self.by_dn.remove(&dn.to_string());
        self.entries.remove(&uuid);
        ResultCode::Success
    }

    /// Rejects a modification set that would strip a value the entry's RDN
    /// still names.
    fn violates_rdn(dn: &Dn, mods: &[Modification]) -> bool {
        let Some(rdn) = dn.rdn() else { return false };
        mods.iter().any(|m| {
            let Some(rdn_value) = rdn.value_of(&m.attr) else { return false };
            match m.mod_type {
                ModificationType::Delete => {
                    m.values.is_empty() || m.values.iter().any(|v| v == rdn_value)
                }
                ModificationType::Replace => !m.values.iter().any(|v| v == rdn_value),
                _ => false,
            }
        })
    }

    fn apply_modify(&self, dn: &Dn, mods: &[Modification]) -> ResultCode {
        let Some(uuid) = self.by_dn.get(&dn.to_string()).map(|e| *e) else {
            return ResultCode::NoSuchObject;
        };
        if Self::violates_rdn(dn, mods) {
            return ResultCode::NotAllowedOnRdn;
        }
        let Some(mut entry) = self.entries.get_mut(&uuid) else {
            return ResultCode::NoSuchObject;
        };
        for m in mods {
            let attr = m.attr.clone();
            match m.mod_type {
                ModificationType::Add => {
                    let values = entry.attrs.entry(attr).or_default();
                    for v in &m.values {
                        if !values.contains(v) {
                            values.push(v.clone());
                        }
                    }
                }
                ModificationType::Delete => {
                    if m.values.is_empty() {
                        entry.attrs.remove(&attr);
                    } else if let Some(values) = entry.attrs.get_mut(&attr) {
                        values.retain(|v| !m.values.contains(v));
                        if values.is_empty() {
                            entry.attrs.remove(&attr);
                        }
                    }
                }
                ModificationType::Replace => {
                    if m.values.is_empty() {
                        entry.attrs.remove(&attr);
                    } else {
                        entry.attrs.insert(attr, m.values.clone());
                    }
                }
                ModificationType::Increment => {
                    let values = entry.attrs.entry(attr).or_default();
                    let delta: i64 = m
                        .values
                        .first()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(1);
                    let current: i64 = values
                        .first()
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    *values = vec![(current + delta).to_string()];
                }
            }
        }
        ResultCode::Success
    }

    fn apply_moddn(&self, msg: &UpdateMsg) -> ResultCode {
        let UpdateOp::ModifyDn { new_rdn, new_superior, delete_old_rdn, .. } = &msg.op
        else {
            return ResultCode::UnwillingToPerform;
        };
        let Some(uuid) = self.by_dn.get(&msg.dn.to_string()).map(|e| *e) else {
            return ResultCode::NoSuchObject;
        };
        let Some(new_parent) = new_superior.clone().or_else(|| msg.dn.parent()) else {
            return ResultCode::UnwillingToPerform;
        };
        if !self.dn_exists(&new_parent) {
            return ResultCode::NoSuchObject;
        }
        let new_dn = new_parent.child(new_rdn.clone());
        if new_dn == msg.dn {
            return ResultCode::Success;
        }
        if self.dn_exists(&new_dn) {
            return ResultCode::EntryAlreadyExists;
        }

        // Move the whole branch: the renamed entry plus every descendant.
        let moved: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| e.value().dn == msg.dn || e.value().dn.is_descendant_of(&msg.dn))
            .map(|e| *e.key())
            .collect();
        for id in moved {
            let Some(mut entry) = self.entries.get_mut(&id) else { continue };
            let Some(rebased) = entry.dn.rebase(&msg.dn, &new_dn) else { continue };
            self.by_dn.remove(&entry.dn.to_string());
            self.by_dn.insert(rebased.to_string(), id);
            entry.dn = rebased;
        }

        if let Some(mut entry) = self.entries.get_mut(&uuid) {
            let old_rdn = msg.dn.rdn().cloned();
            if *delete_old_rdn {
                if let Some(old) = old_rdn {
                    if let Some(value) = old.value_of(old.attr_type()) {
                        if let Some(values) = entry.attrs.get_mut(old.attr_type()) {
                            values.retain(|v| v != value);
                        }
                    }
                }
            }
            if let Some(value) = new_rdn.value_of(new_rdn.attr_type()) {
                let values =
                    entry.attrs.entry(new_rdn.attr_type().to_string()).or_default();
                if !values.iter().any(|v| v == value) {
                    values.push(value.to_string());
                }
            }
        }
        ResultCode::Success
    }
}

#[async_trait]
impl ReplicaBackend for MemoryBackend {
    async fn apply(&self, msg: &UpdateMsg) -> ResultCode {
        let code = match &msg.op {
            UpdateOp::Add { attrs, .. } => self.apply_add(msg.entry_uuid, &msg.dn, attrs),
            UpdateOp::Delete => self.apply_delete(&msg.dn),
            UpdateOp::Modify { mods } => self.apply_modify(&msg.dn, mods),
            UpdateOp::ModifyDn { .. } => self.apply_moddn(msg),
        };
        trace!(csn = %msg.csn, dn = %msg.dn, kind = %msg.kind(), result = %code, "Backend apply");
        code
    }

    async fn find_by_uuid(&self, uuid: Uuid) -> Option<Dn> {
        self.entries.get(&uuid).map(|e| e.dn.clone())
    }

    async fn children_of(&self, dn: &Dn) -> Vec<(Uuid, Dn)> {
        self.entries
            .iter()
            .filter(|e| e.value().dn.parent().as_ref() == Some(dn))
            .map(|e| (*e.key(), e.value().dn.clone()))
            .collect()
    }

    async fn read_historical(&self, uuid: Uuid) -> Vec<String> {
        self.entries.get(&uuid).map(|e| e.historical.clone()).unwrap_or_default()
    }

    async fn write_historical(&self, uuid: Uuid, lines: Vec<String>) {
        if let Some(mut entry) = self.entries.get_mut(&uuid) {
            entry.historical = lines;
        }
    }

    async fn mark_conflict(&self, uuid: Uuid, original_dn: &Dn) {
        if let Some(mut entry) = self.entries.get_mut(&uuid) {
            entry
                .attrs
                .insert(CONFLICT_ATTR.to_string(), vec![original_dn.to_string()]);
        }
    }
}
