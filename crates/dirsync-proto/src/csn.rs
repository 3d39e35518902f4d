//! Change numbers: totally ordered logical timestamps for replicated writes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

/// A logical timestamp uniquely and totally ordering writes across replicas.
///
/// Ordering compares the wall-clock millisecond first, then the sequence
/// counter, then the replica id. The replica id only breaks ties between
/// replicas that generated within the same millisecond; it carries no causal
/// meaning.
///
/// Two change numbers produced by correct generators are never equal: a
/// single replica never reissues a (timestamp, seq) pair, and distinct
/// replicas differ in `replica_id`.
///
/// # Example
///
/// ```rust
/// use dirsync_proto::ChangeNumber;
///
/// let a = ChangeNumber::new(1_000, 0, 1);
/// let b = ChangeNumber::new(1_000, 0, 2);
/// assert!(a.older(&b));
/// assert!(b.newer(&a));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangeNumber {
    /// Milliseconds since the Unix epoch at generation time.
    timestamp_ms: u64,
    /// Disambiguates multiple generations within the same millisecond.
    seq: u16,
    /// Identifier of the replica that generated this change number.
    replica_id: u16,
}

impl ChangeNumber {
    /// Creates a change number from its raw parts.
    #[must_use]
    pub const fn new(timestamp_ms: u64, seq: u16, replica_id: u16) -> Self {
        Self { timestamp_ms, seq, replica_id }
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// Sequence counter within the millisecond.
    #[must_use]
    pub const fn seq(&self) -> u16 {
        self.seq
    }

    /// Replica that generated this change number.
    #[must_use]
    pub const fn replica_id(&self) -> u16 {
        self.replica_id
    }

    /// Returns `true` if `self` was generated strictly before `other` in the
    /// total order.
    #[must_use]
    pub fn older(&self, other: &ChangeNumber) -> bool {
        self < other
    }

    /// Returns `true` if `self` orders before `other` or equals it.
    #[must_use]
    pub fn older_or_equal(&self, other: &ChangeNumber) -> bool {
        self <= other
    }

    /// Returns `true` if `self` orders strictly after `other`.
    #[must_use]
    pub fn newer(&self, other: &ChangeNumber) -> bool {
        self > other
    }

    /// Returns `true` if `self` orders after `other` or equals it.
    #[must_use]
    pub fn newer_or_equal(&self, other: &ChangeNumber) -> bool {
        self >= other
    }
}

impl fmt::Display for ChangeNumber {
    /// Formats as 24 hex characters: `<ts:016x><seq:04x><replica:04x>`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:04x}{:04x}", self.timestamp_ms, self.seq, self.replica_id)
    }
}

impl FromStr for ChangeNumber {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtoError::InvalidChangeNumber(s.to_string()));
        }
        let timestamp_ms = u64::from_str_radix(&s[..16], 16)
            .map_err(|_| ProtoError::InvalidChangeNumber(s.to_string()))?;
        let seq = u16::from_str_radix(&s[16..20], 16)
            .map_err(|_| ProtoError::InvalidChangeNumber(s.to_string()))?;
        let replica_id = u16::from_str_radix(&s[20..24], 16)
            .map_err(|_| ProtoError::InvalidChangeNumber(s.to_string()))?;
        Ok(Self { timestamp_ms, seq, replica_id })
    }
}

/// Per-replica generator of monotonically increasing [`ChangeNumber`]s.
///
/// Every value returned by [`new_csn`](Self::new_csn) is strictly greater
/// than anything previously generated or observed by this generator. When
/// the wall clock has not advanced past the last issued timestamp, the
/// sequence counter increments instead; on sequence overflow the timestamp
/// is bumped by one millisecond.
///
/// The generator is a plain field of its owning replication context and is
/// synchronized by that context, not internally.
#[derive(Debug)]
pub struct ChangeNumberGenerator {
    replica_id: u16,
    last_timestamp_ms: u64,
    last_seq: u16,
}

impl ChangeNumberGenerator {
    /// Creates a generator for the given replica id, positioned at the
    /// current wall clock.
    #[must_use]
    pub fn new(replica_id: u16) -> Self {
        Self { replica_id, last_timestamp_ms: 0, last_seq: 0 }
    }

    /// The replica this generator produces change numbers for.
    #[must_use]
    pub const fn replica_id(&self) -> u16 {
        self.replica_id
    }

    /// Generates the next change number, strictly greater than every value
    /// previously generated or adjusted past.
    pub fn new_csn(&mut self) -> ChangeNumber {
        self.csn_at(now_ms())
    }

    /// Like [`new_csn`](Self::new_csn) with an explicit wall clock reading,
    /// for deterministic tests.
    pub fn csn_at(&mut self, now_ms: u64) -> ChangeNumber {
        if now_ms > self.last_timestamp_ms {
            self.last_timestamp_ms = now_ms;
            self.last_seq = 0;
        } else if self.last_seq == u16::MAX {
            // Same-millisecond burst exhausted the sequence space; borrow
            // from the future rather than going backwards.
            self.last_timestamp_ms += 1;
            self.last_seq = 0;
        } else {
            self.last_seq += 1;
        }
        ChangeNumber::new(self.last_timestamp_ms, self.last_seq, self.replica_id)
    }

    /// Moves the generator forward so that every future generation orders
    /// after `csn`. Called whenever a remote change number is observed;
    /// preserves the total order without clock synchronization.
    ///
    /// Never moves the generator backwards.
    pub fn adjust(&mut self, csn: &ChangeNumber) {
        if csn.timestamp_ms > self.last_timestamp_ms
            || (csn.timestamp_ms == self.last_timestamp_ms && csn.seq > self.last_seq)
        {
            self.last_timestamp_ms = csn.timestamp_ms;
            self.last_seq = csn.seq;
        }
    }
}

fn now_ms() -> u64 {
    // The epoch is well before any plausible system clock reading; a
    // negative value only appears on grossly misconfigured hosts.
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
