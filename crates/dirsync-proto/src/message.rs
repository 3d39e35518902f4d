//! Replicated update messages and modification primitives.
//!
//! The wire protocol moving these between replicas is a collaborator, not
//! part of this crate; everything here is serde-serializable so the
//! transport can pick its own encoding.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::csn::ChangeNumber;
use crate::dn::{Dn, Rdn};

/// LDAP-style modification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModificationType {
    Add,
    Delete,
    Replace,
    /// Numeric increment. Excluded from historical conflict tracking:
    /// increments commute at the backend, a gap inherited from the original
    /// implementation.
    Increment,
}

/// One attribute-level modification inside a MODIFY operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    /// Attribute type, lowercase.
    pub attr: String,
    /// Attribute options (tagging subtypes such as `lang-fr`), ordered.
    pub options: BTreeSet<String>,
    pub mod_type: ModificationType,
    /// Values touched; empty means "the whole attribute" for DELETE.
    pub values: Vec<String>,
}

impl Modification {
    /// Convenience constructor for an option-less modification.
    #[must_use]
    pub fn new(attr: &str, mod_type: ModificationType, values: Vec<String>) -> Self {
        Self {
            attr: attr.to_ascii_lowercase(),
            options: BTreeSet::new(),
            mod_type,
            values,
        }
    }
}

/// Operation payload of an [`UpdateMsg`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOp {
    Add {
        /// Unique id of the parent entry, `None` for the context base entry.
        parent_uuid: Option<Uuid>,
        /// Initial attributes of the new entry.
        attrs: BTreeMap<String, Vec<String>>,
    },
    Delete,
    Modify {
        mods: Vec<Modification>,
    },
    ModifyDn {
        new_rdn: Rdn,
        /// New parent DN, `None` to keep the current parent.
        new_superior: Option<Dn>,
        /// Unique id of the new parent, when one was named.
        new_superior_uuid: Option<Uuid>,
        delete_old_rdn: bool,
    },
}

/// Coarse operation kind, used for dependency analysis and metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Add,
    Delete,
    Modify,
    ModifyDn,
}

impl OpKind {
    /// Static label for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Modify => "modify",
            Self::ModifyDn => "modify_dn",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A replicated write: one operation on one entry, stamped with the
/// change number assigned by the originating replica.
///
/// The target entry is identified both by DN (what the backend executes
/// against) and by its immutable unique id (what conflict resolution
/// correlates on, since the DN is mutable under concurrent rename).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMsg {
    pub csn: ChangeNumber,
    pub entry_uuid: Uuid,
    pub dn: Dn,
    pub op: UpdateOp,
}

impl UpdateMsg {
    /// The coarse kind of this operation.
    #[must_use]
    pub fn kind(&self) -> OpKind {
        match self.op {
            UpdateOp::Add { .. } => OpKind::Add,
            UpdateOp::Delete => OpKind::Delete,
            UpdateOp::Modify { .. } => OpKind::Modify,
            UpdateOp::ModifyDn { .. } => OpKind::ModifyDn,
        }
    }

    /// For a MODRDN, the DN the entry will carry after the rename; `None`
    /// for other operations.
    #[must_use]
    pub fn dn_after_rename(&self) -> Option<Dn> {
        match &self.op {
            UpdateOp::ModifyDn { new_rdn, new_superior, .. } => {
                let parent = new_superior.clone().or_else(|| self.dn.parent())?;
                Some(parent.child(new_rdn.clone()))
            }
            _ => None,
        }
    }
}

/// Result of a backend apply, the subset of LDAP result codes the
/// conflict resolver dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    NoSuchObject,
    EntryAlreadyExists,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    UnwillingToPerform,
    ObjectclassViolation,
    /// Any other LDAP result code; never interpreted as a naming conflict.
    Other(u32),
}

impl ResultCode {
    /// Returns `true` for [`ResultCode::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Static label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoSuchObject => "no_such_object",
            Self::EntryAlreadyExists => "entry_already_exists",
            Self::NotAllowedOnNonLeaf => "not_allowed_on_nonleaf",
            Self::NotAllowedOnRdn => "not_allowed_on_rdn",
            Self::UnwillingToPerform => "unwilling_to_perform",
            Self::ObjectclassViolation => "objectclass_violation",
            Self::Other(_) => "other",
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "other({code})"),
            _ => f.write_str(self.as_str()),
        }
    }
}
