//! Storage seam between the replication core and the directory backend.
//!
//! The core never touches entries directly; it hands complete operations to
//! a [`ReplicaBackend`] and dispatches on the LDAP result code that comes
//! back. Per-entry exclusive locking during an apply is the backend's
//! guarantee, so the core holds no per-entry lock of its own.

pub mod memory;

use async_trait::async_trait;
use dirsync_proto::{Dn, ResultCode, UpdateMsg};
use uuid::Uuid;

pub use memory::MemoryBackend;

/// Directory storage as seen by the replication core.
#[async_trait]
pub trait ReplicaBackend: Send + Sync {
    /// Executes one replicated operation and reports the LDAP result code.
    ///
    /// Must be atomic per entry: a failed apply leaves the entry untouched.
    async fn apply(&self, msg: &UpdateMsg) -> ResultCode;

    /// Current DN of the entry carrying this unique id, if it exists.
    async fn find_by_uuid(&self, uuid: Uuid) -> Option<Dn>;

    /// Direct children of `dn`, with their unique ids.
    async fn children_of(&self, dn: &Dn) -> Vec<(Uuid, Dn)>;

    /// Persisted historical-ledger lines of an entry; empty if none.
    async fn read_historical(&self, uuid: Uuid) -> Vec<String>;

    /// Replaces an entry's persisted historical-ledger lines.
    async fn write_historical(&self, uuid: Uuid, lines: Vec<String>);

    /// Tags an entry as a naming-conflict survivor, recording the DN it
    /// originally asked for.
    async fn mark_conflict(&self, uuid: Uuid, original_dn: &Dn);
}
