//! Value types for Straylight directory replication.
//!
//! This crate holds the foundational, transport-agnostic types shared by the
//! replication engine and its collaborators:
//!
//! - [`ChangeNumber`] / [`ChangeNumberGenerator`]: the logical-clock
//!   primitive establishing a total, replica-independent order over writes.
//! - [`ServerState`]: the per-replica high-water-mark vector.
//! - [`Dn`] / [`Rdn`]: the minimal DN algebra used by dependency analysis
//!   and conflict renames, including the synthetic conflict RDN form.
//! - [`UpdateMsg`] and friends: the replicated operations themselves, plus
//!   the LDAP-style [`ResultCode`]s the conflict resolver dispatches on.
//!
//! Everything here is plain data: no I/O, no runtime, no locking. The
//! replication engine in the root crate owns the behavior.

pub mod csn;
pub mod dn;
pub mod error;
pub mod message;
pub mod state;

pub use csn::{ChangeNumber, ChangeNumberGenerator};
pub use dn::{Dn, Rdn};
pub use error::ProtoError;
pub use message::{Modification, ModificationType, OpKind, ResultCode, UpdateMsg, UpdateOp};
pub use state::ServerState;
