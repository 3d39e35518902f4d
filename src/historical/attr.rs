//! Per-attribute conflict ledgers.
//!
//! One [`AttrHistorical`] exists per (attribute type, option set) pair ever
//! touched on an entry. The shape is chosen once from the attribute's
//! cardinality and matched exhaustively afterwards: single-valued
//! attributes track one add/delete slot, multi-valued attributes track one
//! [`ValueInfo`] per distinct value plus a whole-attribute delete slot.
//!
//! The governing rule everywhere is newest-change-number-wins: a
//! modification older than what the ledger already recorded for the same
//! value or slot is stripped from the operation, so that replicas applying
//! the same set of operations in any arrival order converge.

use std::collections::BTreeMap;

use dirsync_proto::{ChangeNumber, Modification, ModificationType};
use serde::{Deserialize, Serialize};

/// Attribute cardinality, fixed by schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    Single,
    Multiple,
}

/// Conflict memory for one value of a multi-valued attribute.
///
/// Identity is the value alone; the times record when the value was last
/// added/updated and last deleted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueInfo {
    pub update_time: Option<ChangeNumber>,
    pub delete_time: Option<ChangeNumber>,
}

impl ValueInfo {
    /// Whether the value is present on the entry as far as the ledger knows.
    #[must_use]
    pub fn is_present(&self) -> bool {
        match (self.update_time, self.delete_time) {
            (Some(update), Some(delete)) => delete.older(&update),
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.update_time.is_none() && self.delete_time.is_none()
    }
}

/// Outcome of replaying one modification against the ledger.
///
/// `keep` is the (possibly rewritten) modification to hand to the backend,
/// or `None` when the modification lost to newer recorded history and must
/// be dropped from the operation. The modification list is never mutated in
/// place; callers rebuild a filtered list from these verdicts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub keep: Option<Modification>,
    pub conflict: bool,
}

impl Verdict {
    fn kept(m: Modification) -> Self {
        Self { keep: Some(m), conflict: false }
    }

    fn rewritten(m: Modification) -> Self {
        Self { keep: Some(m), conflict: true }
    }

    fn dropped() -> Self {
        Self { keep: None, conflict: true }
    }
}

/// Conflict ledger for one (attribute type, option set) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrHistorical {
    Single {
        add_time: Option<ChangeNumber>,
        delete_time: Option<ChangeNumber>,
        /// The value currently held, as of the newest recorded event.
        value: Option<String>,
    },
    Multiple {
        /// When the whole attribute was last deleted without a value list.
        attr_delete_time: Option<ChangeNumber>,
        values: BTreeMap<String, ValueInfo>,
    },
}

/// Advances a time slot, never backwards.
fn advance(slot: &mut Option<ChangeNumber>, csn: ChangeNumber) {
    if slot.is_none_or(|current| csn.newer(&current)) {
        *slot = Some(csn);
    }
}

impl AttrHistorical {
    /// Creates an empty ledger of the given shape.
    #[must_use]
    pub fn new(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::Single => {
                Self::Single { add_time: None, delete_time: None, value: None }
            }
            Cardinality::Multiple => {
                Self::Multiple { attr_delete_time: None, values: BTreeMap::new() }
            }
        }
    }

    /// The shape of this ledger.
    #[must_use]
    pub fn cardinality(&self) -> Cardinality {
        match self {
            Self::Single { .. } => Cardinality::Single,
            Self::Multiple { .. } => Cardinality::Multiple,
        }
    }

    /// Returns `true` once every recorded event has been purged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Single { add_time, delete_time, .. } => {
                add_time.is_none() && delete_time.is_none()
            }
            Self::Multiple { attr_delete_time, values } => {
                attr_delete_time.is_none() && values.is_empty()
            }
        }
    }

    /// The oldest change number still recorded, for purge reporting.
    #[must_use]
    pub fn oldest_csn(&self) -> Option<ChangeNumber> {
        match self {
            Self::Single { add_time, delete_time, .. } => {
                min_opt(*add_time, *delete_time)
            }
            Self::Multiple { attr_delete_time, values } => {
                let mut oldest = *attr_delete_time;
                for info in values.values() {
                    oldest = min_opt(oldest, min_opt(info.update_time, info.delete_time));
                }
                oldest
            }
        }
    }

    /// Applies a modification unconditionally.
    ///
    /// Used on the single-writer path, where the caller already holds the
    /// entry lock and knows there is no concurrent history to lose to.
    /// REPLACE stamps both the add and delete slots. INCREMENT is not
    /// recorded; see [`ModificationType::Increment`].
    pub fn process_non_conflicting(&mut self, csn: ChangeNumber, m: &Modification) {
        match self {
            Self::Single { add_time, delete_time, value } => match m.mod_type {
                ModificationType::Add => {
                    advance(add_time, csn);
                    *value = m.values.first().cloned();
                }
                ModificationType::Delete => {
                    advance(delete_time, csn);
                    *value = None;
                }
                ModificationType::Replace => {
                    advance(add_time, csn);
                    advance(delete_time, csn);
                    *value = m.values.first().cloned();
                }
                ModificationType::Increment => {}
            },
            Self::Multiple { attr_delete_time, values } => match m.mod_type {
                ModificationType::Add => {
                    for v in &m.values {
                        advance(&mut values.entry(v.clone()).or_default().update_time, csn);
                    }
                }
                ModificationType::Delete if !m.values.is_empty() => {
                    for v in &m.values {
                        advance(&mut values.entry(v.clone()).or_default().delete_time, csn);
                    }
                }
                ModificationType::Delete => {
                    advance(attr_delete_time, csn);
                    for info in values.values_mut() {
                        if info.is_present() {
                            advance(&mut info.delete_time, csn);
                        }
                    }
                }
                ModificationType::Replace => {
                    advance(attr_delete_time, csn);
                    for (v, info) in values.iter_mut() {
                        if info.is_present() && !m.values.contains(v) {
                            advance(&mut info.delete_time, csn);
                        }
                    }
                    for v in &m.values {
                        advance(&mut values.entry(v.clone()).or_default().update_time, csn);
                    }
                }
                ModificationType::Increment => {}
            },
        }
    }

    /// Replays a modification carried by a remote operation against the
    /// recorded history, returning the filtered/rewritten form.
    pub fn replay(&mut self, csn: ChangeNumber, m: Modification) -> Verdict {
        // Increments bypass the ledger entirely; concurrent increments are
        // not conflict-resolved.
        if m.mod_type == ModificationType::Increment {
            return Verdict::kept(m);
        }
        match self {
            Self::Single { .. } => self.replay_single(csn, m),
            Self::Multiple { .. } => self.replay_multiple(csn, m),
        }
    }

    fn replay_single(&mut self, csn: ChangeNumber, mut m: Modification) -> Verdict {
        let Self::Single { add_time, delete_time, value } = self else { unreachable!() };
        match m.mod_type {
            ModificationType::Delete => {
                // Accept only a delete newer than the recorded add that
                // targets the recorded value (or no value at all).
                let newer_than_add = add_time.is_none_or(|add| csn.newer(&add));
                let target_matches = m.values.is_empty()
                    || m.values.first().map(String::as_str) == value.as_deref();
                if newer_than_add && target_matches {
                    advance(delete_time, csn);
                    *value = None;
                    Verdict::kept(m)
                } else {
                    Verdict::dropped()
                }
            }
            ModificationType::Add => {
                let after_delete = delete_time.is_none_or(|del| csn.newer_or_equal(&del));
                let before_add = add_time.is_some_and(|add| csn.older(&add));
                if after_delete && before_add {
                    // Obsolete add that still has to land: a newer add was
                    // already applied, so rewrite to a replace carrying this
                    // value rather than failing at the backend.
                    *add_time = Some(csn);
                    *value = m.values.first().cloned();
                    m.mod_type = ModificationType::Replace;
                    Verdict::rewritten(m)
                } else if after_delete
                    && add_time.is_none_or(|add| {
                        delete_time.is_some_and(|del| add.older_or_equal(&del))
                    })
                {
                    // Clean add over an absent (or deleted-then-absent) slot.
                    *add_time = Some(csn);
                    *value = m.values.first().cloned();
                    Verdict::kept(m)
                } else {
                    Verdict::dropped()
                }
            }
            ModificationType::Replace => {
                if delete_time.is_some_and(|del| csn.older(&del)) {
                    Verdict::dropped()
                } else {
                    *add_time = Some(csn);
                    *delete_time = Some(csn);
                    *value = m.values.first().cloned();
                    Verdict::kept(m)
                }
            }
            ModificationType::Increment => Verdict::kept(m),
        }
    }

    fn replay_multiple(&mut self, csn: ChangeNumber, mut m: Modification) -> Verdict {
        let Self::Multiple { attr_delete_time, values } = self else { unreachable!() };
        match m.mod_type {
            ModificationType::Add => {
                let mut kept = Vec::with_capacity(m.values.len());
                let mut conflict = false;
                for v in std::mem::take(&mut m.values) {
                    let info = values.entry(v.clone()).or_default();
                    let deleted_newer = attr_delete_time
                        .is_some_and(|del| del.newer_or_equal(&csn))
                        || info.delete_time.is_some_and(|del| del.newer_or_equal(&csn));
                    let added_newer =
                        info.update_time.is_some_and(|upd| upd.newer_or_equal(&csn));
                    if deleted_newer || added_newer {
                        conflict = true;
                    } else {
                        advance(&mut info.update_time, csn);
                        kept.push(v);
                    }
                }
                if kept.is_empty() {
                    Verdict { keep: None, conflict }
                } else {
                    m.values = kept;
                    Verdict { keep: Some(m), conflict }
                }
            }
            ModificationType::Delete if !m.values.is_empty() => {
                let mut kept = Vec::with_capacity(m.values.len());
                let mut conflict = false;
                for v in std::mem::take(&mut m.values) {
                    let info = values.entry(v.clone()).or_default();
                    let add_newer = info.update_time.is_some_and(|upd| upd.newer(&csn));
                    let already_deleted = info
                        .delete_time
                        .is_some_and(|del| del.newer_or_equal(&csn))
                        || attr_delete_time.is_some_and(|del| del.newer_or_equal(&csn));
                    if add_newer || already_deleted {
                        conflict = true;
                    } else {
                        advance(&mut info.delete_time, csn);
                        kept.push(v);
                    }
                }
                if kept.is_empty() {
                    Verdict { keep: None, conflict }
                } else {
                    m.values = kept;
                    Verdict { keep: Some(m), conflict }
                }
            }
            ModificationType::Delete => {
                // Whole-attribute delete. Values added after the delete's
                // change number survive; the modification is narrowed to the
                // values it may legitimately remove.
                advance(attr_delete_time, csn);
                let mut survivors = false;
                let mut dead = Vec::new();
                for (v, info) in values.iter_mut() {
                    if !info.is_present() {
                        continue;
                    }
                    if info.update_time.is_some_and(|upd| upd.newer(&csn)) {
                        survivors = true;
                    } else {
                        advance(&mut info.delete_time, csn);
                        dead.push(v.clone());
                    }
                }
                if !survivors {
                    Verdict::kept(m)
                } else if dead.is_empty() {
                    Verdict::dropped()
                } else {
                    m.values = dead;
                    Verdict::rewritten(m)
                }
            }
            ModificationType::Replace => {
                if attr_delete_time.is_some_and(|del| csn.older(&del)) {
                    return Verdict::dropped();
                }
                advance(attr_delete_time, csn);
                let mut survivors = Vec::new();
                for (v, info) in values.iter_mut() {
                    if !info.is_present() || m.values.contains(v) {
                        continue;
                    }
                    if info.update_time.is_some_and(|upd| upd.newer(&csn)) {
                        // Concurrently added with a newer change number; the
                        // replace must not wipe it.
                        survivors.push(v.clone());
                    } else {
                        advance(&mut info.delete_time, csn);
                    }
                }
                for v in &m.values {
                    let info = values.entry(v.clone()).or_default();
                    if info.update_time.is_none_or(|upd| upd.older(&csn)) {
                        info.update_time = Some(csn);
                    }
                }
                if survivors.is_empty() {
                    Verdict::kept(m)
                } else {
                    m.values.extend(survivors);
                    Verdict::rewritten(m)
                }
            }
            ModificationType::Increment => Verdict::kept(m),
        }
    }

    /// Drops every recorded event older than `cutoff_ms`, returning how many
    /// were purged. Empties may remain; the entry-level ledger removes them.
    pub fn purge(&mut self, cutoff_ms: u64) -> usize {
        let expired = |slot: &Option<ChangeNumber>| {
            slot.is_some_and(|csn| csn.timestamp_ms() < cutoff_ms)
        };
        let mut purged = 0;
        match self {
            Self::Single { add_time, delete_time, value } => {
                if expired(add_time) {
                    *add_time = None;
                    *value = None;
                    purged += 1;
                }
                if expired(delete_time) {
                    *delete_time = None;
                    purged += 1;
                }
            }
            Self::Multiple { attr_delete_time, values } => {
                if expired(attr_delete_time) {
                    *attr_delete_time = None;
                    purged += 1;
                }
                values.retain(|_, info| {
                    if expired(&info.update_time) {
                        info.update_time = None;
                        purged += 1;
                    }
                    if expired(&info.delete_time) {
                        info.delete_time = None;
                        purged += 1;
                    }
                    !info.is_empty()
                });
            }
        }
        purged
    }
}

fn min_opt(a: Option<ChangeNumber>, b: Option<ChangeNumber>) -> Option<ChangeNumber> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) => x,
        (None, y) => y,
    }
}
