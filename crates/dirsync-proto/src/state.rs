//! Per-replica progress vectors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::csn::ChangeNumber;
use crate::error::ProtoError;

/// The highest [`ChangeNumber`] this node has durably observed from each
/// replica in a naming context.
///
/// Values only ever move forward: [`update`](Self::update) is a no-op for
/// anything not strictly newer than the stored value for that replica, which
/// makes it idempotent under replays.
///
/// # Example
///
/// ```rust
/// use dirsync_proto::{ChangeNumber, ServerState};
///
/// let mut state = ServerState::new();
/// let csn = ChangeNumber::new(1_000, 0, 7);
/// assert!(state.update(csn));
/// assert!(!state.update(csn)); // second application does not advance
/// assert!(state.cover(&csn));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    // BTreeMap keeps iteration (and the persisted form) deterministic.
    states: BTreeMap<u16, ChangeNumber>,
}

impl ServerState {
    /// Creates an empty state vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` if it is newer than the stored value for its replica.
    ///
    /// Returns whether the state advanced.
    pub fn update(&mut self, csn: ChangeNumber) -> bool {
        match self.states.get(&csn.replica_id()) {
            Some(current) if csn.older_or_equal(current) => false,
            _ => {
                self.states.insert(csn.replica_id(), csn);
                true
            }
        }
    }

    /// The highest change number observed from `replica_id`, if any.
    #[must_use]
    pub fn max_csn(&self, replica_id: u16) -> Option<ChangeNumber> {
        self.states.get(&replica_id).copied()
    }

    /// Returns `true` if this state has already observed `csn`.
    #[must_use]
    pub fn cover(&self, csn: &ChangeNumber) -> bool {
        self.states
            .get(&csn.replica_id())
            .is_some_and(|current| current.newer_or_equal(csn))
    }

    /// Returns `true` if this state covers every change number in `other`.
    #[must_use]
    pub fn covers(&self, other: &ServerState) -> bool {
        other.states.values().all(|csn| self.cover(csn))
    }

    /// Iterates over `(replica_id, csn)` pairs in replica-id order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, ChangeNumber)> + '_ {
        self.states.iter().map(|(id, csn)| (*id, *csn))
    }

    /// Number of replicas this state has heard from.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns `true` if no replica has been observed yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl fmt::Display for ServerState {
    /// Space-separated change numbers, one per replica, in replica-id order.
    ///
    /// The replica id is embedded in each change number, so the list alone
    /// reconstructs the vector.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for csn in self.states.values() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{csn}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ServerState {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut state = ServerState::new();
        for token in s.split_whitespace() {
            state.update(token.parse()?);
        }
        Ok(state)
    }
}
