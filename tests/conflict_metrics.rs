//! Conflict counters observed across full-domain replay scenarios.
//!
//! Kept in its own binary so the process-global registry sees exactly the
//! increments these scenarios produce.

use std::collections::BTreeMap;
use std::sync::Arc;

use dirsync::metrics::{RESOLVED_NAMING_CONFLICTS, UNRESOLVED_NAMING_CONFLICTS};
use dirsync::{
    ChangeNumber, MemoryBackend, ReplicaBackend, ReplicaConfig, ReplicationDomain,
    StaticRegistry, UpdateMsg, UpdateOp,
};
use tokio::sync::mpsc;
use uuid::Uuid;

fn domain() -> (Arc<ReplicationDomain>, Arc<MemoryBackend>) {
    let config: ReplicaConfig =
        toml::from_str("replica_id = 1\nbase_dn = \"dc=example\"\n").unwrap();
    let backend = Arc::new(MemoryBackend::new("dc=example".parse().unwrap()));
    let registry = Arc::new(StaticRegistry::with_single_valued(&["displayname"]));
    let (tx, _rx) = mpsc::unbounded_channel();
    let domain = Arc::new(ReplicationDomain::new(config, backend.clone(), registry, tx));
    (domain, backend)
}

fn add(ts: u64, replica_id: u16, uuid: Uuid, dn: &str, parent: Option<Uuid>) -> UpdateMsg {
    UpdateMsg {
        csn: ChangeNumber::new(ts, 0, replica_id),
        entry_uuid: uuid,
        dn: dn.parse().unwrap(),
        op: UpdateOp::Add { parent_uuid: parent, attrs: BTreeMap::new() },
    }
}

fn counters() -> (u64, u64) {
    (
        RESOLVED_NAMING_CONFLICTS.get().unwrap().get(),
        UNRESOLVED_NAMING_CONFLICTS.get().unwrap().get(),
    )
}

#[tokio::test]
async fn test_resolution_outcomes_land_on_the_right_counter() {
    dirsync::metrics::init();
    let (domain, backend) = domain();

    // Automatic repair: an add naming its parent's old DN is re-parented.
    let parent_uuid = Uuid::new_v4();
    domain
        .replay(add(100, 2, parent_uuid, "ou=staff,dc=example", None))
        .await
        .unwrap();

    let (resolved_before, unresolved_before) = counters();
    let child_uuid = Uuid::new_v4();
    domain
        .replay(add(200, 2, child_uuid, "cn=x,ou=people,dc=example", Some(parent_uuid)))
        .await
        .unwrap();
    assert_eq!(
        backend.find_by_uuid(child_uuid).await.unwrap().to_string(),
        "cn=x,ou=staff,dc=example"
    );
    let (resolved, unresolved) = counters();
    assert_eq!(resolved, resolved_before + 1);
    assert_eq!(unresolved, unresolved_before);

    // Administrator-visible outcome: a duplicate DN from a different entry
    // survives under a conflict RDN.
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();
    domain.replay(add(300, 2, first, "cn=dup,dc=example", None)).await.unwrap();

    let (resolved_before, unresolved_before) = counters();
    domain.replay(add(400, 3, second, "cn=dup,dc=example", None)).await.unwrap();
    assert!(backend.is_conflict_marked(second));
    let (resolved, unresolved) = counters();
    assert_eq!(unresolved, unresolved_before + 1);
    assert_eq!(resolved, resolved_before);
}
