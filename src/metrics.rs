//! Prometheus metrics collection for dirsync.
//!
//! Tracks replay throughput, conflict resolution outcomes, pending-queue
//! depth and historical-ledger housekeeping. The registry is process-global;
//! an embedding server exposes [`gather_metrics`] however it likes.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

// ========================================================================
// Counters (monotonic increasing)
// ========================================================================

/// Remote updates replayed, by operation kind.
pub static UPDATES_REPLAYED: OnceLock<IntCounterVec> = OnceLock::new();

/// Replay failures, by error code.
pub static REPLAY_ERRORS: OnceLock<IntCounterVec> = OnceLock::new();

/// Naming conflicts fixed automatically.
pub static RESOLVED_NAMING_CONFLICTS: OnceLock<IntCounter> = OnceLock::new();

/// Naming conflicts left for an administrator or repair tool.
pub static UNRESOLVED_NAMING_CONFLICTS: OnceLock<IntCounter> = OnceLock::new();

/// Modify operations that had at least one change stripped or rewritten by
/// the historical ledger.
pub static MODIFY_CONFLICTS: OnceLock<IntCounter> = OnceLock::new();

/// Historical values dropped by purge during re-encoding.
pub static PURGED_VALUES: OnceLock<IntCounter> = OnceLock::new();

/// Updates that had to wait on a causal dependency before replay.
pub static DEPENDENCY_STALLS: OnceLock<IntCounter> = OnceLock::new();

// ========================================================================
// Gauges (can increase/decrease)
// ========================================================================

/// Locally originated writes awaiting commit or forwarding.
pub static LOCAL_PENDING: OnceLock<IntGauge> = OnceLock::new();

/// Inbound writes awaiting replay or commit.
pub static REMOTE_PENDING: OnceLock<IntGauge> = OnceLock::new();

/// Initialize the Prometheus metrics registry.
///
/// Must be called once at startup before any metrics are recorded.
pub fn init() {
    let r = registry();

    // Helper macro to register metric
    macro_rules! register {
        ($metric:ident, $init:expr) => {
            let m = $init.expect(concat!(stringify!($metric), " creation failed"));
            if let Err(e) = r.register(Box::new(m.clone())) {
                tracing::warn!(error = %e, concat!("Failed to register metric ", stringify!($metric)));
            }
            let _ = $metric.set(m);
        };
    }

    register!(UPDATES_REPLAYED, IntCounterVec::new(Opts::new("dirsync_updates_replayed_total", "Remote updates replayed by operation kind"), &["kind"]));
    register!(REPLAY_ERRORS, IntCounterVec::new(Opts::new("dirsync_replay_errors_total", "Replay failures by error code"), &["error"]));
    register!(RESOLVED_NAMING_CONFLICTS, IntCounter::new("dirsync_resolved_naming_conflicts_total", "Naming conflicts fixed automatically"));
    register!(UNRESOLVED_NAMING_CONFLICTS, IntCounter::new("dirsync_unresolved_naming_conflicts_total", "Naming conflicts left for an administrator"));
    register!(MODIFY_CONFLICTS, IntCounter::new("dirsync_modify_conflicts_total", "Modify operations altered by the historical ledger"));
    register!(PURGED_VALUES, IntCounter::new("dirsync_purged_values_total", "Historical values dropped by purge"));
    register!(DEPENDENCY_STALLS, IntCounter::new("dirsync_dependency_stalls_total", "Updates parked on causal dependencies"));
    register!(LOCAL_PENDING, IntGauge::new("dirsync_local_pending", "Local writes awaiting commit or forwarding"));
    register!(REMOTE_PENDING, IntGauge::new("dirsync_remote_pending", "Inbound writes awaiting replay or commit"));
}

/// Gather all metrics and encode them in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Prometheus metrics were not valid UTF-8");
            String::new()
        }
    }
}

// ============================================================================
// Helper functions for metric updates
// ============================================================================

/// Record one replayed update by operation kind.
#[inline]
pub fn record_replay(kind: &str) {
    if let Some(c) = UPDATES_REPLAYED.get() {
        c.with_label_values(&[kind]).inc();
    }
}

/// Record a replay failure by error code.
#[inline]
pub fn record_replay_error(error: &str) {
    if let Some(c) = REPLAY_ERRORS.get() {
        c.with_label_values(&[error]).inc();
    }
}

/// Record the outcome of a naming-conflict resolution.
#[inline]
pub fn record_naming_conflict(resolved: bool) {
    let metric = if resolved {
        RESOLVED_NAMING_CONFLICTS.get()
    } else {
        UNRESOLVED_NAMING_CONFLICTS.get()
    };
    if let Some(c) = metric {
        c.inc();
    }
}

/// Record a modify operation altered by the historical ledger.
#[inline]
pub fn record_modify_conflict() {
    if let Some(c) = MODIFY_CONFLICTS.get() {
        c.inc();
    }
}

/// Record values dropped by a purge pass.
#[inline]
pub fn record_purged(count: usize) {
    if count == 0 {
        return;
    }
    if let Some(c) = PURGED_VALUES.get() {
        c.inc_by(count as u64);
    }
}

/// Record an update parked on an unmet dependency.
#[inline]
pub fn record_dependency_stall() {
    if let Some(c) = DEPENDENCY_STALLS.get() {
        c.inc();
    }
}

/// Update the pending-queue depth gauges.
#[inline]
pub fn set_pending_depth(local: usize, remote: usize) {
    if let Some(g) = LOCAL_PENDING.get() {
        g.set(local as i64);
    }
    if let Some(g) = REMOTE_PENDING.get() {
        g.set(remote as i64);
    }
}
