//! dirsync - multi-master directory replication core
//!
//! Conflict resolution and causal ordering for a replicated directory
//! store: change-number generation, per-entry historical ledgers with
//! newest-wins replay, pending-change trackers enforcing commit order, and
//! the naming-conflict resolver that keeps concurrently diverging replicas
//! converging on the same tree.
//!
//! The wire protocol between replicas and the directory storage itself are
//! collaborators behind seams: storage implements
//! [`backend::ReplicaBackend`], transport consumes the outbound
//! [`UpdateMsg`](dirsync_proto::UpdateMsg) channel handed to a
//! [`domain::ReplicationDomain`].

pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod historical;
pub mod metrics;
pub mod pending;
pub mod resolver;

pub use backend::{MemoryBackend, ReplicaBackend};
pub use config::ReplicaConfig;
pub use domain::{FlusherHandle, ReplicationDomain};
pub use error::{ConfigError, HistoricalError, ReplayError};
pub use historical::{AttributeRegistry, EntryHistorical, StaticRegistry};
pub use pending::{PendingChanges, RemotePendingChanges};
pub use resolver::{ConflictResolver, ResolverOutcome};

pub use dirsync_proto::{
    ChangeNumber, ChangeNumberGenerator, Dn, Modification, ModificationType, OpKind,
    Rdn, ResultCode, ServerState, UpdateMsg, UpdateOp,
};
