//! Distinguished names, just enough of them for replication.
//!
//! Conflict resolution and dependency analysis need DN structure (parent,
//! ancestry, branch renames) and the synthetic conflict RDN form, not a
//! schema-aware LDAP DN implementation. Attribute types are normalized to
//! lowercase; values are compared verbatim. Escaped separators inside
//! values are out of scope for this core.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// A relative distinguished name: one or more `attr=value` components
/// joined by `+`.
///
/// Multi-component RDNs appear in practice only through the synthetic
/// conflict form `entryuuid=<uuid>+<original-rdn>` produced by
/// [`Rdn::conflict`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rdn {
    components: Vec<(String, String)>,
}

impl Rdn {
    /// Builds a single-component RDN. The attribute type is lowercased.
    #[must_use]
    pub fn single(attr: &str, value: &str) -> Self {
        Self { components: vec![(attr.to_ascii_lowercase(), value.to_string())] }
    }

    /// Builds the synthetic conflict RDN `entryuuid=<uuid>+<original-rdn>`.
    ///
    /// The form is deterministic across replicas (it depends only on the
    /// entry's immutable unique id and its original RDN), so every replica
    /// relocates a conflicting entry to the same place.
    #[must_use]
    pub fn conflict(entry_uuid: &uuid::Uuid, original: &Rdn) -> Self {
        let mut components = vec![("entryuuid".to_string(), entry_uuid.to_string())];
        components.extend(original.components.iter().cloned());
        Self { components }
    }

    /// Returns `true` if this is a synthetic conflict RDN.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.components.len() > 1 && self.components[0].0 == "entryuuid"
    }

    /// The first (primary) attribute type of this RDN.
    #[must_use]
    pub fn attr_type(&self) -> &str {
        &self.components[0].0
    }

    /// Returns `true` if any component uses the given attribute type.
    #[must_use]
    pub fn has_attr_type(&self, attr: &str) -> bool {
        let attr = attr.to_ascii_lowercase();
        self.components.iter().any(|(a, _)| *a == attr)
    }

    /// The value held for `attr`, if present.
    #[must_use]
    pub fn value_of(&self, attr: &str) -> Option<&str> {
        let attr = attr.to_ascii_lowercase();
        self.components.iter().find(|(a, _)| *a == attr).map(|(_, v)| v.as_str())
    }
}

impl fmt::Display for Rdn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (attr, value) in &self.components {
            if !first {
                f.write_str("+")?;
            }
            write!(f, "{attr}={value}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Rdn {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut components = Vec::new();
        for part in s.split('+') {
            let (attr, value) = part
                .split_once('=')
                .ok_or_else(|| ProtoError::InvalidDn(s.to_string()))?;
            let attr = attr.trim().to_ascii_lowercase();
            let value = value.trim();
            if attr.is_empty() || value.is_empty() {
                return Err(ProtoError::InvalidDn(s.to_string()));
            }
            components.push((attr, value.to_string()));
        }
        if components.is_empty() {
            return Err(ProtoError::InvalidDn(s.to_string()));
        }
        Ok(Self { components })
    }
}

/// A distinguished name: RDN components leaf-first, as in
/// `cn=x,ou=people,dc=example`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dn {
    rdns: Vec<Rdn>,
}

impl Dn {
    /// The empty (root) DN.
    #[must_use]
    pub fn root() -> Self {
        Self { rdns: Vec::new() }
    }

    /// Returns `true` for the empty DN.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Number of RDN components.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// The leaf RDN, if any.
    #[must_use]
    pub fn rdn(&self) -> Option<&Rdn> {
        self.rdns.first()
    }

    /// Everything above the leaf RDN; `None` for the root DN.
    #[must_use]
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            None
        } else {
            Some(Dn { rdns: self.rdns[1..].to_vec() })
        }
    }

    /// A DN one level below `self`, named by `rdn`.
    #[must_use]
    pub fn child(&self, rdn: Rdn) -> Dn {
        let mut rdns = Vec::with_capacity(self.rdns.len() + 1);
        rdns.push(rdn);
        rdns.extend(self.rdns.iter().cloned());
        Dn { rdns }
    }

    /// Replaces the leaf RDN, keeping the parent unchanged.
    #[must_use]
    pub fn with_rdn(&self, rdn: Rdn) -> Dn {
        match self.parent() {
            Some(parent) => parent.child(rdn),
            None => Dn { rdns: vec![rdn] },
        }
    }

    /// Strict-descendant test: `self` lies below `other` and differs from it.
    #[must_use]
    pub fn is_descendant_of(&self, other: &Dn) -> bool {
        self.rdns.len() > other.rdns.len()
            && self.rdns[self.rdns.len() - other.rdns.len()..] == other.rdns[..]
    }

    /// Strict-ancestor test, the inverse of [`is_descendant_of`](Self::is_descendant_of).
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Dn) -> bool {
        other.is_descendant_of(self)
    }

    /// Re-roots a descendant of `old_ancestor` under `new_ancestor`.
    ///
    /// Returns `None` when `self` is not below `old_ancestor`.
    #[must_use]
    pub fn rebase(&self, old_ancestor: &Dn, new_ancestor: &Dn) -> Option<Dn> {
        if self == old_ancestor {
            return Some(new_ancestor.clone());
        }
        if !self.is_descendant_of(old_ancestor) {
            return None;
        }
        let keep = self.rdns.len() - old_ancestor.rdns.len();
        let mut rdns: Vec<Rdn> = self.rdns[..keep].to_vec();
        rdns.extend(new_ancestor.rdns.iter().cloned());
        Some(Dn { rdns })
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for rdn in &self.rdns {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{rdn}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Dn {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Dn::root());
        }
        let rdns = s.split(',').map(str::parse).collect::<Result<Vec<Rdn>, _>>()?;
        Ok(Dn { rdns })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dn(s: &str) -> Dn {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let d = dn("CN=Admin, ou=People,dc=example");
        assert_eq!(d.to_string(), "cn=Admin,ou=people,dc=example");
        assert_eq!(d.depth(), 3);
        assert_eq!(d.rdn().unwrap().attr_type(), "cn");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("cn".parse::<Dn>().is_err());
        assert!("cn=,ou=people".parse::<Dn>().is_err());
        assert!("=x".parse::<Dn>().is_err());
        assert!("".parse::<Dn>().unwrap().is_root());
    }

    #[test]
    fn test_parent_and_child() {
        let d = dn("cn=x,ou=people");
        assert_eq!(d.parent().unwrap(), dn("ou=people"));
        assert_eq!(dn("ou=people").child(Rdn::single("cn", "x")), d);
        assert_eq!(dn("ou=people").parent().unwrap(), Dn::root());
        assert!(Dn::root().parent().is_none());
    }

    #[test]
    fn test_ancestry() {
        let base = dn("dc=example");
        let people = dn("ou=people,dc=example");
        let leaf = dn("cn=x,ou=people,dc=example");

        assert!(leaf.is_descendant_of(&people));
        assert!(leaf.is_descendant_of(&base));
        assert!(base.is_ancestor_of(&leaf));
        assert!(!people.is_descendant_of(&people));
        assert!(!people.is_descendant_of(&leaf));
        // A same-named RDN under a different branch is unrelated.
        assert!(!dn("cn=x,ou=staff,dc=example").is_descendant_of(&people));
    }

    #[test]
    fn test_rebase_moves_whole_branch() {
        let old_parent = dn("ou=people,dc=example");
        let new_parent = dn("ou=staff,dc=example");
        let leaf = dn("cn=x,ou=people,dc=example");
        let deep = dn("cn=y,cn=x,ou=people,dc=example");

        assert_eq!(leaf.rebase(&old_parent, &new_parent).unwrap(), dn("cn=x,ou=staff,dc=example"));
        assert_eq!(
            deep.rebase(&old_parent, &new_parent).unwrap(),
            dn("cn=y,cn=x,ou=staff,dc=example")
        );
        assert!(dn("cn=z,ou=other").rebase(&old_parent, &new_parent).is_none());
    }

    #[test]
    fn test_with_rdn_replaces_leaf() {
        let d = dn("cn=x,ou=people");
        assert_eq!(d.with_rdn(Rdn::single("cn", "y")), dn("cn=y,ou=people"));
    }

    #[test]
    fn test_conflict_rdn_form() {
        let id = uuid::Uuid::nil();
        let original = Rdn::single("cn", "x");
        let conflict = Rdn::conflict(&id, &original);
        assert!(conflict.is_conflict());
        assert_eq!(conflict.to_string(), format!("entryuuid={id}+cn=x"));
        // Round-trips through the string form.
        let parsed: Rdn = conflict.to_string().parse().unwrap();
        assert_eq!(parsed, conflict);
        assert_eq!(parsed.value_of("cn"), Some("x"));
    }
}
