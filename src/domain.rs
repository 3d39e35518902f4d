//! Per-naming-context replication driver.
//!
//! A [`ReplicationDomain`] ties the pieces together for one replicated
//! subtree: it stamps local writes, replays remote ones through the
//! historical ledger and the conflict resolver, and keeps the `ServerState`
//! honest by only advancing it through the pending trackers. One domain is
//! one value; run several on the shared runtime for several contexts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dirsync_proto::{
    ChangeNumber, ChangeNumberGenerator, Dn, Modification, Rdn, ResultCode, ServerState,
    UpdateMsg, UpdateOp,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::ReplicaBackend;
use crate::config::ReplicaConfig;
use crate::error::ReplayError;
use crate::historical::{AttributeRegistry, EntryHistorical};
use crate::metrics;
use crate::pending::{OpSummary, PendingChanges, RemotePendingChanges};
use crate::resolver::{ConflictResolver, ResolverOutcome};

/// Replication engine for one naming context.
pub struct ReplicationDomain {
    config: ReplicaConfig,
    base_dn: Dn,
    backend: Arc<dyn ReplicaBackend>,
    registry: Arc<dyn AttributeRegistry>,
    generator: Arc<Mutex<ChangeNumberGenerator>>,
    state: Mutex<ServerState>,
    local: Mutex<PendingChanges>,
    remote: Mutex<RemotePendingChanges>,
    outbound: mpsc::UnboundedSender<UpdateMsg>,
    resolver: ConflictResolver,
    acks: Mutex<HashMap<ChangeNumber, usize>>,
    ack_notify: Notify,
}

impl ReplicationDomain {
    pub fn new(
        config: ReplicaConfig,
        backend: Arc<dyn ReplicaBackend>,
        registry: Arc<dyn AttributeRegistry>,
        outbound: mpsc::UnboundedSender<UpdateMsg>,
    ) -> Self {
        let base_dn = config.base_dn();
        let generator =
            Arc::new(Mutex::new(ChangeNumberGenerator::new(config.replica_id)));
        let resolver = ConflictResolver::new(
            backend.clone(),
            base_dn.clone(),
            generator.clone(),
            registry.clone(),
            config.purge_delay(),
        );
        Self {
            config,
            base_dn,
            backend,
            registry,
            generator,
            state: Mutex::new(ServerState::new()),
            local: Mutex::new(PendingChanges::new()),
            remote: Mutex::new(RemotePendingChanges::new()),
            outbound,
            resolver,
            acks: Mutex::new(HashMap::new()),
            ack_notify: Notify::new(),
        }
    }

    /// Base DN of the replicated subtree.
    #[must_use]
    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    /// Snapshot of the committed replication state.
    #[must_use]
    pub fn server_state(&self) -> ServerState {
        self.state.lock().clone()
    }

    // ------------------------------------------------------------------
    // Local write lifecycle
    // ------------------------------------------------------------------

    /// Executes a locally originated ADD and forwards it.
    pub async fn local_add(
        &self,
        entry_uuid: Uuid,
        dn: Dn,
        parent_uuid: Option<Uuid>,
        attrs: std::collections::BTreeMap<String, Vec<String>>,
    ) -> Result<ChangeNumber, ReplayError> {
        let op = UpdateOp::Add { parent_uuid, attrs };
        self.local_op(entry_uuid, dn, op).await
    }

    /// Executes a locally originated DELETE and forwards it.
    pub async fn local_delete(
        &self,
        entry_uuid: Uuid,
        dn: Dn,
    ) -> Result<ChangeNumber, ReplayError> {
        self.local_op(entry_uuid, dn, UpdateOp::Delete).await
    }

    /// Executes a locally originated MODIFY and forwards it.
    pub async fn local_modify(
        &self,
        entry_uuid: Uuid,
        dn: Dn,
        mods: Vec<Modification>,
    ) -> Result<ChangeNumber, ReplayError> {
        self.local_op(entry_uuid, dn, UpdateOp::Modify { mods }).await
    }

    /// Executes a locally originated MODRDN and forwards it.
    #[allow(clippy::too_many_arguments)]
    pub async fn local_moddn(
        &self,
        entry_uuid: Uuid,
        dn: Dn,
        new_rdn: Rdn,
        new_superior: Option<Dn>,
        new_superior_uuid: Option<Uuid>,
        delete_old_rdn: bool,
    ) -> Result<ChangeNumber, ReplayError> {
        let op = UpdateOp::ModifyDn { new_rdn, new_superior, new_superior_uuid, delete_old_rdn };
        self.local_op(entry_uuid, dn, op).await
    }

    async fn local_op(
        &self,
        entry_uuid: Uuid,
        dn: Dn,
        op: UpdateOp,
    ) -> Result<ChangeNumber, ReplayError> {
        let msg_proto = UpdateMsg { csn: ChangeNumber::new(0, 0, 0), entry_uuid, dn, op };
        let csn = {
            let mut generator = self.generator.lock();
            self.local.lock().put_local_change(&mut generator, OpSummary::of(&msg_proto))
        };
        let msg = UpdateMsg { csn, ..msg_proto };

        let code = self.backend.apply(&msg).await;
        if !code.is_success() {
            self.local.lock().abort(csn);
            debug!(csn = %csn, dn = %msg.dn, result = %code, "Local apply failed; change aborted");
            return Err(ReplayError::Backend(format!(
                "local {} on {} failed: {}",
                msg.kind(),
                msg.dn,
                code
            )));
        }

        self.record_historical(&msg).await;
        self.local.lock().commit(csn, msg);
        self.flush_committed();
        self.pump().await;

        if self.config.assured.enabled {
            self.wait_assured(csn).await;
        }
        Ok(csn)
    }

    /// Quorum acknowledgement for an assured local write.
    pub fn ack(&self, csn: ChangeNumber) {
        *self.acks.lock().entry(csn).or_insert(0) += 1;
        self.ack_notify.notify_waiters();
    }

    async fn wait_assured(&self, csn: ChangeNumber) {
        let quorum = self.config.assured.quorum;
        let deadline = Duration::from_millis(self.config.assured.timeout_ms);
        let wait = async {
            loop {
                let notified = self.ack_notify.notified();
                if self.acks.lock().get(&csn).copied().unwrap_or(0) >= quorum {
                    break;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(deadline, wait).await.is_err() {
            warn!(csn = %csn, quorum, "Assured write not acknowledged before timeout");
        }
        self.acks.lock().remove(&csn);
    }

    // ------------------------------------------------------------------
    // Remote replay
    // ------------------------------------------------------------------

    /// Replays one inbound update.
    ///
    /// Always records the update for ordering first; an update with unmet
    /// causal dependencies is parked and replayed later by the flush path.
    pub async fn replay(&self, msg: UpdateMsg) -> Result<(), ReplayError> {
        self.generator.lock().adjust(&msg.csn);
        let parked = {
            let mut remote = self.remote.lock();
            remote.put_remote_update(msg.clone());
            remote.check_dependencies(&msg)
        };
        if parked {
            metrics::record_dependency_stall();
            return Ok(());
        }
        let result = self.drive_one(msg).await;
        self.pump().await;
        result
    }

    /// Applies one update, resolving naming conflicts, until it lands, is
    /// recognized as a no-op, or the attempt bound runs out. The change
    /// number commits in every branch; a replica never stalls on one entry.
    async fn drive_one(&self, msg: UpdateMsg) -> Result<(), ReplayError> {
        let csn = msg.csn;
        let kind = msg.kind();

        let msg = match self.prefilter_modify(msg).await {
            Some(msg) => msg,
            None => {
                // Every change was already superseded; pure no-op.
                metrics::record_replay(kind.as_str());
                self.commit_remote(csn);
                return Ok(());
            }
        };

        let mut current = msg;
        let max_attempts = self.config.resolver.max_attempts;
        let mut last_code = ResultCode::Success;
        for attempt in 0..max_attempts {
            let code = self.backend.apply(&current).await;
            if code.is_success() {
                // The prefilter pass already wrote the ledger for a MODIFY.
                if !matches!(current.op, UpdateOp::Modify { .. }) {
                    self.record_historical(&current).await;
                }
                metrics::record_replay(kind.as_str());
                if attempt > 0 {
                    debug!(csn = %csn, attempts = attempt + 1, "Update landed after conflict resolution");
                }
                self.commit_remote(csn);
                return Ok(());
            }
            last_code = code;
            match self.resolver.resolve(&current, code).await {
                ResolverOutcome::Retry(rewritten) => current = rewritten,
                ResolverOutcome::Done => {
                    metrics::record_replay(kind.as_str());
                    self.commit_remote(csn);
                    return Ok(());
                }
                ResolverOutcome::Unresolved => {
                    metrics::record_replay_error("unresolved");
                    self.commit_remote(csn);
                    return Err(ReplayError::Unresolved { csn, code });
                }
            }
        }

        warn!(csn = %csn, attempts = max_attempts, result = %last_code, "Giving up on conflicted update");
        metrics::record_replay_error("retries_exhausted");
        metrics::record_naming_conflict(false);
        self.commit_remote(csn);
        Err(ReplayError::RetriesExhausted { csn, attempts: max_attempts })
    }

    /// Runs a remote MODIFY through the historical ledger, writing the
    /// updated ledger back. Returns `None` when every change was stripped.
    async fn prefilter_modify(&self, msg: UpdateMsg) -> Option<UpdateMsg> {
        let UpdateOp::Modify { mods } = &msg.op else { return Some(msg) };
        let mods = mods.clone();
        let lines = self.backend.read_historical(msg.entry_uuid).await;
        let mut hist = EntryHistorical::decode(
            &lines,
            self.registry.as_ref(),
            self.config.purge_delay(),
        );
        let (kept, conflict) =
            hist.replay_modify(msg.csn, mods, self.registry.as_ref());
        if conflict {
            metrics::record_modify_conflict();
        }
        let (lines, purged) = hist.encode(msg.csn.timestamp_ms());
        metrics::record_purged(purged);
        self.backend.write_historical(msg.entry_uuid, lines).await;
        if kept.is_empty() {
            debug!(csn = %msg.csn, dn = %msg.dn, "Modify fully superseded by newer history");
            return None;
        }
        Some(UpdateMsg { op: UpdateOp::Modify { mods: kept }, ..msg })
    }

    /// Updates the target entry's persisted ledger after a successful apply.
    async fn record_historical(&self, msg: &UpdateMsg) {
        match &msg.op {
            UpdateOp::Add { attrs, .. } => {
                let mut hist = EntryHistorical::new(self.config.purge_delay());
                hist.process_add(msg.csn, attrs, self.registry.as_ref());
                let (lines, _) = hist.encode(msg.csn.timestamp_ms());
                self.backend.write_historical(msg.entry_uuid, lines).await;
            }
            UpdateOp::Modify { mods } => {
                let lines = self.backend.read_historical(msg.entry_uuid).await;
                let mut hist = EntryHistorical::decode(
                    &lines,
                    self.registry.as_ref(),
                    self.config.purge_delay(),
                );
                hist.process_local_modify(msg.csn, mods, self.registry.as_ref());
                let (lines, purged) = hist.encode(msg.csn.timestamp_ms());
                metrics::record_purged(purged);
                self.backend.write_historical(msg.entry_uuid, lines).await;
            }
            UpdateOp::ModifyDn { .. } => {
                let lines = self.backend.read_historical(msg.entry_uuid).await;
                let mut hist = EntryHistorical::decode(
                    &lines,
                    self.registry.as_ref(),
                    self.config.purge_delay(),
                );
                hist.record_entry_moddn(msg.csn);
                let (lines, _) = hist.encode(msg.csn.timestamp_ms());
                self.backend.write_historical(msg.entry_uuid, lines).await;
            }
            UpdateOp::Delete => {}
        }
    }

    // ------------------------------------------------------------------
    // Flushing
    // ------------------------------------------------------------------

    fn commit_remote(&self, csn: ChangeNumber) {
        self.remote.lock().commit(csn);
        self.flush_committed();
    }

    /// Drains both trackers' contiguous committed prefixes into the shared
    /// `ServerState`.
    pub fn flush_committed(&self) {
        let mut state = self.state.lock();
        let mut local = self.local.lock();
        let mut remote = self.remote.lock();
        local.push_committed_changes(&mut state, &self.outbound);
        remote.push_committed_changes(&mut state);
        metrics::set_pending_depth(local.len(), remote.len());
    }

    /// Replays updates whose dependencies became covered, until none are
    /// releasable. Failures are logged; one stuck update never blocks the
    /// rest.
    pub async fn pump(&self) {
        loop {
            let released = {
                let state = self.state.lock();
                self.remote.lock().get_next_update(&state)
            };
            let Some(msg) = released else { break };
            if let Err(e) = self.drive_one(msg).await {
                warn!(error = %e, "Released update failed during replay");
            }
        }
    }

    /// Spawns the periodic flush task on the shared runtime.
    pub fn spawn_flusher(self: &Arc<Self>) -> FlusherHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let domain = Arc::clone(self);
        let interval = domain.config.flush_interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        domain.flush_committed();
                        domain.pump().await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            // Final synchronous flush on the way out.
            domain.flush_committed();
            info!(base_dn = %domain.base_dn, "Replication flusher stopped");
        });
        FlusherHandle { stop: stop_tx, task }
    }
}

/// Handle to the background flush task.
pub struct FlusherHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FlusherHandle {
    /// Stops the task after one final flush.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::historical::StaticRegistry;
    use dirsync_proto::ModificationType;
    use std::collections::BTreeMap;

    fn dn(s: &str) -> Dn {
        s.parse().unwrap()
    }

    fn config() -> ReplicaConfig {
        toml::from_str(
            r#"
            replica_id = 1
            base_dn = "dc=example"
            "#,
        )
        .unwrap()
    }

    fn domain() -> (Arc<ReplicationDomain>, Arc<MemoryBackend>, mpsc::UnboundedReceiver<UpdateMsg>) {
        let backend = Arc::new(MemoryBackend::new(dn("dc=example")));
        let registry = Arc::new(StaticRegistry::with_single_valued(&["displayname"]));
        let (tx, rx) = mpsc::unbounded_channel();
        let domain =
            Arc::new(ReplicationDomain::new(config(), backend.clone(), registry, tx));
        (domain, backend, rx)
    }

    fn remote_msg(ts: u64, replica: u16, dn_s: &str, op: UpdateOp) -> UpdateMsg {
        UpdateMsg {
            csn: ChangeNumber::new(ts, 0, replica),
            entry_uuid: Uuid::new_v4(),
            dn: dn(dn_s),
            op,
        }
    }

    #[tokio::test]
    async fn test_local_add_forwards_and_advances_state() {
        let (domain, backend, mut rx) = domain();
        let uuid = Uuid::new_v4();
        let csn = domain
            .local_add(uuid, dn("cn=x,dc=example"), None, BTreeMap::new())
            .await
            .unwrap();

        let forwarded = rx.try_recv().unwrap();
        assert_eq!(forwarded.csn, csn);
        assert_eq!(domain.server_state().max_csn(1), Some(csn));
        assert!(backend.find_by_uuid(uuid).await.is_some());
    }

    #[tokio::test]
    async fn test_local_failure_is_aborted_not_forwarded() {
        let (domain, _backend, mut rx) = domain();
        let err = domain
            .local_add(Uuid::new_v4(), dn("cn=x,ou=gone,dc=example"), None, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::Backend(_)));
        assert!(rx.try_recv().is_err());
        assert!(domain.server_state().is_empty());
    }

    #[tokio::test]
    async fn test_replay_add_and_state_advance() {
        let (domain, backend, _rx) = domain();
        let msg = remote_msg(
            100,
            2,
            "cn=r,dc=example",
            UpdateOp::Add { parent_uuid: None, attrs: BTreeMap::new() },
        );
        domain.replay(msg.clone()).await.unwrap();
        assert!(backend.find_by_uuid(msg.entry_uuid).await.is_some());
        assert_eq!(domain.server_state().max_csn(2), Some(msg.csn));
    }

    #[tokio::test]
    async fn test_dependency_parks_until_parent_lands() {
        let (domain, backend, _rx) = domain();
        let parent = remote_msg(
            100,
            2,
            "ou=people,dc=example",
            UpdateOp::Add { parent_uuid: None, attrs: BTreeMap::new() },
        );
        let child = remote_msg(
            200,
            2,
            "cn=x,ou=people,dc=example",
            UpdateOp::Add { parent_uuid: Some(parent.entry_uuid), attrs: BTreeMap::new() },
        );

        // The child's csn is newer but it arrives while the parent add is
        // still pending in the remote tracker.
        domain.remote.lock().put_remote_update(parent.clone());
        domain.replay(child.clone()).await.unwrap();
        assert!(backend.find_by_uuid(child.entry_uuid).await.is_none());

        // Driving the parent releases the child through the pump.
        domain.drive_one(parent.clone()).await.unwrap();
        domain.pump().await;
        assert!(backend.find_by_uuid(child.entry_uuid).await.is_some());
        assert_eq!(domain.server_state().max_csn(2), Some(child.csn));
    }

    #[tokio::test]
    async fn test_superseded_modify_is_noop_but_commits() {
        let (domain, backend, _rx) = domain();
        let uuid = Uuid::new_v4();
        let add = UpdateMsg {
            csn: ChangeNumber::new(100, 0, 2),
            entry_uuid: uuid,
            dn: dn("cn=x,dc=example"),
            op: UpdateOp::Add { parent_uuid: None, attrs: BTreeMap::new() },
        };
        domain.replay(add).await.unwrap();

        let replace = |ts, replica, value: &str| UpdateMsg {
            csn: ChangeNumber::new(ts, 0, replica),
            entry_uuid: uuid,
            dn: dn("cn=x,dc=example"),
            op: UpdateOp::Modify {
                mods: vec![Modification::new(
                    "displayname",
                    ModificationType::Replace,
                    vec![value.into()],
                )],
            },
        };
        domain.replay(replace(500, 2, "current")).await.unwrap();

        // An older replace from another replica must lose.
        let stale = replace(300, 3, "stale");
        domain.replay(stale.clone()).await.unwrap();
        assert_eq!(backend.attr_values(uuid, "displayname").unwrap(), vec!["current".to_string()]);
        assert_eq!(domain.server_state().max_csn(3), Some(stale.csn));
    }

    #[tokio::test]
    async fn test_flusher_shutdown() {
        let (domain, _backend, _rx) = domain();
        let flusher = domain.spawn_flusher();
        flusher.shutdown().await;
    }

    #[tokio::test]
    async fn test_assured_ack_releases_waiter() {
        let backend = Arc::new(MemoryBackend::new(dn("dc=example")));
        let registry = Arc::new(StaticRegistry::with_single_valued(&[]));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = config();
        config.assured.enabled = true;
        config.assured.quorum = 1;
        config.assured.timeout_ms = 5_000;
        let domain =
            Arc::new(ReplicationDomain::new(config, backend, registry, tx));

        let acker = domain.clone();
        let writer = tokio::spawn(async move {
            domain
                .local_add(Uuid::new_v4(), dn("cn=x,dc=example"), None, BTreeMap::new())
                .await
        });
        // Ack whatever change number the writer allocated.
        let csn = loop {
            if let Some(csn) = acker.server_state().max_csn(1) {
                break csn;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        acker.ack(csn);
        writer.await.unwrap().unwrap();
    }
}
