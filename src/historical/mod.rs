//! Per-entry historical ledger.
//!
//! Every replicated entry carries one multi-valued operational attribute
//! (`ds-sync-hist`) recording, per attribute and per value, when things were
//! last added, replaced and deleted. [`EntryHistorical`] is the in-memory
//! form: decoded at the start of conflict handling for a write, mutated as
//! the write is evaluated, re-encoded (purged) and written back as part of
//! the same write. Instances are transient; nothing here is kept resident.

mod attr;

pub use attr::{AttrHistorical, Cardinality, ValueInfo, Verdict};

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use dirsync_proto::{ChangeNumber, Modification};
use tracing::warn;

/// Where an attribute's cardinality comes from.
///
/// A real deployment backs this with the schema; tests use a closure or the
/// provided map form. Unknown attributes decode as skipped (schema drift is
/// tolerated) and replay as multi-valued, the shape that loses no
/// information.
pub trait AttributeRegistry: Send + Sync {
    fn cardinality(&self, attr: &str) -> Option<Cardinality>;
}

impl<F> AttributeRegistry for F
where
    F: Fn(&str) -> Option<Cardinality> + Send + Sync,
{
    fn cardinality(&self, attr: &str) -> Option<Cardinality> {
        self(attr)
    }
}

/// A fixed attribute-to-cardinality map, mostly for tests and tools.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    single: BTreeSet<String>,
}

impl StaticRegistry {
    /// Registry where the listed attributes are single-valued and everything
    /// else is multi-valued.
    #[must_use]
    pub fn with_single_valued(attrs: &[&str]) -> Self {
        Self { single: attrs.iter().map(|a| a.to_ascii_lowercase()).collect() }
    }
}

impl AttributeRegistry for StaticRegistry {
    fn cardinality(&self, attr: &str) -> Option<Cardinality> {
        if self.single.contains(&attr.to_ascii_lowercase()) {
            Some(Cardinality::Single)
        } else {
            Some(Cardinality::Multiple)
        }
    }
}

/// Key of one attribute ledger: attribute type plus its option set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AttrKey {
    pub name: String,
    pub options: BTreeSet<String>,
}

impl AttrKey {
    fn of(m: &Modification) -> Self {
        Self { name: m.attr.clone(), options: m.options.clone() }
    }

    fn encode(&self) -> String {
        if self.options.is_empty() {
            self.name.clone()
        } else {
            let mut s = self.name.clone();
            for opt in &self.options {
                s.push(';');
                s.push_str(opt);
            }
            s
        }
    }

    fn decode(s: &str) -> Self {
        let mut parts = s.split(';');
        let name = parts.next().unwrap_or_default().to_ascii_lowercase();
        let options = parts.map(str::to_string).collect();
        Self { name, options }
    }
}

/// Reserved line key for the entry add/rename markers; a user attribute of
/// this name cannot be tracked.
const DN_KEY: &str = "dn";

/// Per-entry aggregate of attribute ledgers plus the entry-level add and
/// rename dates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHistorical {
    entry_add_csn: Option<ChangeNumber>,
    entry_moddn_csn: Option<ChangeNumber>,
    attributes: BTreeMap<AttrKey, AttrHistorical>,
    purge_delay: Duration,
}

impl EntryHistorical {
    /// An empty ledger, as for an entry that has never been written through
    /// replication.
    #[must_use]
    pub fn new(purge_delay: Duration) -> Self {
        Self {
            entry_add_csn: None,
            entry_moddn_csn: None,
            attributes: BTreeMap::new(),
            purge_delay,
        }
    }

    /// Records the entry's creation change number (advance-only).
    pub fn record_entry_add(&mut self, csn: ChangeNumber) {
        if self.entry_add_csn.is_none_or(|c| csn.newer(&c)) {
            self.entry_add_csn = Some(csn);
        }
    }

    /// Records the entry's last rename change number (advance-only).
    pub fn record_entry_moddn(&mut self, csn: ChangeNumber) {
        if self.entry_moddn_csn.is_none_or(|c| csn.newer(&c)) {
            self.entry_moddn_csn = Some(csn);
        }
    }

    /// When the entry was created, as recorded by the ledger.
    #[must_use]
    pub fn entry_add_csn(&self) -> Option<ChangeNumber> {
        self.entry_add_csn
    }

    /// When the entry was last renamed, as recorded by the ledger.
    #[must_use]
    pub fn entry_moddn_csn(&self) -> Option<ChangeNumber> {
        self.entry_moddn_csn
    }

    /// The oldest change number still recorded anywhere in the ledger.
    #[must_use]
    pub fn oldest_csn(&self) -> Option<ChangeNumber> {
        let mut oldest = match (self.entry_add_csn, self.entry_moddn_csn) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (x, None) => x,
            (None, y) => y,
        };
        for hist in self.attributes.values() {
            oldest = match (oldest, hist.oldest_csn()) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (x, None) => x,
                (None, y) => y,
            };
        }
        oldest
    }

    fn ledger_for(
        &mut self,
        key: AttrKey,
        registry: &dyn AttributeRegistry,
    ) -> &mut AttrHistorical {
        let cardinality =
            registry.cardinality(&key.name).unwrap_or(Cardinality::Multiple);
        self.attributes.entry(key).or_insert_with(|| AttrHistorical::new(cardinality))
    }

    /// Applies a local (single-writer) modification list unconditionally.
    pub fn process_local_modify(
        &mut self,
        csn: ChangeNumber,
        mods: &[Modification],
        registry: &dyn AttributeRegistry,
    ) {
        for m in mods {
            self.ledger_for(AttrKey::of(m), registry).process_non_conflicting(csn, m);
        }
    }

    /// Replays a remote modification list against the ledger.
    ///
    /// Returns the filtered (possibly rewritten) modification list together
    /// with a flag reporting whether any modification conflicted. An empty
    /// returned list means the whole operation became a no-op; the caller
    /// must still advance `ServerState` for its change number.
    pub fn replay_modify(
        &mut self,
        csn: ChangeNumber,
        mods: Vec<Modification>,
        registry: &dyn AttributeRegistry,
    ) -> (Vec<Modification>, bool) {
        let mut kept = Vec::with_capacity(mods.len());
        let mut any_conflict = false;
        for m in mods {
            let verdict = self.ledger_for(AttrKey::of(&m), registry).replay(csn, m);
            any_conflict |= verdict.conflict;
            if let Some(m) = verdict.keep {
                kept.push(m);
            }
        }
        (kept, any_conflict)
    }

    /// Applies an entry's initial attribute set, as done when a replicated
    /// ADD commits.
    pub fn process_add(
        &mut self,
        csn: ChangeNumber,
        attrs: &BTreeMap<String, Vec<String>>,
        registry: &dyn AttributeRegistry,
    ) {
        self.record_entry_add(csn);
        for (attr, values) in attrs {
            let m = Modification::new(
                attr,
                dirsync_proto::ModificationType::Add,
                values.clone(),
            );
            self.ledger_for(AttrKey::of(&m), registry).process_non_conflicting(csn, &m);
        }
    }

    /// Serializes the ledger into the persisted operational-attribute lines,
    /// dropping (and counting) events older than the purge delay relative to
    /// `now_ms`.
    ///
    /// Line format: `attrName[;opt;opt...]:<csn-hex>:<op>[:<value>]` with
    /// `<op>` one of `add`, `del`, `repl`, `attrDel`, plus the synthetic
    /// `dn:<csn>:add` / `dn:<csn>:moddn` entry markers.
    pub fn encode(&mut self, now_ms: u64) -> (Vec<String>, usize) {
        let purged = self.purge(now_ms);
        let mut lines = Vec::new();
        if let Some(csn) = self.entry_add_csn {
            lines.push(format!("{DN_KEY}:{csn}:add"));
        }
        if let Some(csn) = self.entry_moddn_csn {
            lines.push(format!("{DN_KEY}:{csn}:moddn"));
        }
        for (key, hist) in &self.attributes {
            let name = key.encode();
            match hist {
                AttrHistorical::Single { add_time, delete_time, value } => {
                    match (add_time, delete_time) {
                        (Some(add), Some(del)) if add == del => {
                            lines.push(match value {
                                Some(v) => format!("{name}:{add}:repl:{v}"),
                                None => format!("{name}:{add}:repl"),
                            });
                        }
                        _ => {
                            if let Some(add) = add_time {
                                lines.push(match value {
                                    Some(v) => format!("{name}:{add}:add:{v}"),
                                    None => format!("{name}:{add}:add"),
                                });
                            }
                            if let Some(del) = delete_time {
                                lines.push(format!("{name}:{del}:del"));
                            }
                        }
                    }
                }
                AttrHistorical::Multiple { attr_delete_time, values } => {
                    if let Some(del) = attr_delete_time {
                        lines.push(format!("{name}:{del}:attrDel"));
                    }
                    for (value, info) in values {
                        if let Some(upd) = info.update_time {
                            lines.push(format!("{name}:{upd}:add:{value}"));
                        }
                        if let Some(del) = info.delete_time {
                            lines.push(format!("{name}:{del}:del:{value}"));
                        }
                    }
                }
            }
        }
        (lines, purged)
    }

    /// Drops events older than the purge delay; returns the purge count.
    /// Entry add/rename markers age out like any other event.
    fn purge(&mut self, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(self.purge_delay.as_millis() as u64);
        let mut purged = 0;
        for marker in [&mut self.entry_add_csn, &mut self.entry_moddn_csn] {
            if marker.is_some_and(|c| c.timestamp_ms() < cutoff) {
                *marker = None;
                purged += 1;
            }
        }
        self.attributes.retain(|_, hist| {
            purged += hist.purge(cutoff);
            !hist.is_empty()
        });
        purged
    }

    /// Rebuilds a ledger from its persisted lines.
    ///
    /// Never fails: malformed lines and attributes the registry does not
    /// know are skipped with a warning, so one bad line cannot take the
    /// whole entry out of conflict resolution.
    #[must_use]
    pub fn decode(
        lines: &[String],
        registry: &dyn AttributeRegistry,
        purge_delay: Duration,
    ) -> Self {
        let mut hist = Self::new(purge_delay);
        for line in lines {
            if let Err(reason) = hist.decode_line(line, registry) {
                warn!(line = %line, reason = %reason, "Skipping malformed historical line");
            }
        }
        hist
    }

    fn decode_line(
        &mut self,
        line: &str,
        registry: &dyn AttributeRegistry,
    ) -> Result<(), crate::error::HistoricalError> {
        use crate::error::HistoricalError;

        let mut parts = line.splitn(4, ':');
        let key = parts.next().unwrap_or_default();
        let csn: ChangeNumber = parts
            .next()
            .ok_or_else(|| HistoricalError::MalformedLine(line.to_string()))?
            .parse()
            .map_err(|_| HistoricalError::MalformedLine(line.to_string()))?;
        let op = parts
            .next()
            .ok_or_else(|| HistoricalError::MalformedLine(line.to_string()))?;
        let value = parts.next();

        if key == DN_KEY {
            match op {
                "add" => self.record_entry_add(csn),
                "moddn" => self.record_entry_moddn(csn),
                _ => return Err(HistoricalError::MalformedLine(line.to_string())),
            }
            return Ok(());
        }

        let key = AttrKey::decode(key);
        let Some(cardinality) = registry.cardinality(&key.name) else {
            return Err(HistoricalError::UnknownAttribute(key.name));
        };
        let hist = self
            .attributes
            .entry(key)
            .or_insert_with(|| AttrHistorical::new(cardinality));

        match (hist, op) {
            (AttrHistorical::Single { add_time, value: slot, .. }, "add") => {
                if add_time.is_none_or(|c| csn.newer(&c)) {
                    *add_time = Some(csn);
                    *slot = value.map(str::to_string);
                }
            }
            (AttrHistorical::Single { delete_time, .. }, "del") => {
                if delete_time.is_none_or(|c| csn.newer(&c)) {
                    *delete_time = Some(csn);
                }
            }
            (AttrHistorical::Single { add_time, delete_time, value: slot }, "repl") => {
                if add_time.is_none_or(|c| csn.newer(&c)) {
                    *add_time = Some(csn);
                    *delete_time = Some(csn);
                    *slot = value.map(str::to_string);
                }
            }
            (AttrHistorical::Multiple { values, .. }, "add" | "del") => {
                let v = value
                    .ok_or_else(|| HistoricalError::MalformedLine(line.to_string()))?;
                let info = values.entry(v.to_string()).or_default();
                let slot =
                    if op == "add" { &mut info.update_time } else { &mut info.delete_time };
                if slot.is_none_or(|c| csn.newer(&c)) {
                    *slot = Some(csn);
                }
            }
            (AttrHistorical::Multiple { attr_delete_time, .. }, "attrDel") => {
                if attr_delete_time.is_none_or(|c| csn.newer(&c)) {
                    *attr_delete_time = Some(csn);
                }
            }
            _ => return Err(HistoricalError::MalformedLine(line.to_string())),
        }
        Ok(())
    }
}
