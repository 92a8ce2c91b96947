//! Resolved Stamp
//!
//! The in-memory cursor carried through a resolver loop: the greatest
//! checkpoint fully applied, the checkpoint currently being worked toward,
//! and the mid-scan offsets that let a partial drain resume after a
//! restart. Serialized as a plain tagged record for memo persistence.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hlc::Hlc;
use crate::ident::TableName;
use crate::types::SelectManyCursor;

/// Progress cursor for one target schema.
///
/// Either `proposed_time` is zero (idle: the committed state) or
/// `proposed_time > committed_time` (a drain is in flight).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStamp {
    /// Greatest checkpoint fully applied to the target.
    #[serde(default)]
    pub committed_time: Hlc,

    /// Checkpoint currently being worked toward; zero when idle.
    #[serde(default)]
    pub proposed_time: Hlc,

    /// Whether the current drain is bulk-loading historical data.
    #[serde(default)]
    pub backfill: bool,

    /// Mid-scan cursor: last table a partial drain emitted from.
    #[serde(default)]
    pub offset_table: Option<TableName>,

    /// Mid-scan cursor: key of the last emitted row.
    #[serde(default)]
    pub offset_key: Vec<u8>,

    /// Mid-scan cursor: timestamp of the last emitted row.
    #[serde(default)]
    pub offset_time: Hlc,
}

impl ResolvedStamp {
    /// Transition `Committed -> Proposed`: begin working toward the next
    /// checkpoint. Fails loudly if the proposal does not roll forward.
    pub fn new_proposed(&self, proposed: Hlc) -> Result<Self> {
        if proposed <= self.committed_time {
            return Err(Error::StampRegression {
                committed: self.committed_time,
                proposed,
            });
        }
        if !self.proposed_time.is_zero() && proposed < self.proposed_time {
            return Err(Error::StampRegression {
                committed: self.proposed_time,
                proposed,
            });
        }
        Ok(Self {
            committed_time: self.committed_time,
            proposed_time: proposed,
            ..Self::default()
        })
    }

    /// Transition `Proposed -> Draining`: capture the scan offsets after a
    /// partial flush so a restart resumes strictly after the flushed rows.
    pub fn new_progress(&self, cursor: &SelectManyCursor) -> Self {
        Self {
            committed_time: self.committed_time,
            proposed_time: self.proposed_time,
            backfill: self.backfill,
            offset_table: cursor.offset_table.clone(),
            offset_key: cursor.offset_key.clone(),
            offset_time: cursor.offset_time,
        }
    }

    /// Offsets pinned to an explicit row position, used when the caller
    /// has buffered past the cursor.
    pub fn progress_at(&self, table: &TableName, time: Hlc, key: &[u8]) -> Self {
        Self {
            committed_time: self.committed_time,
            proposed_time: self.proposed_time,
            backfill: self.backfill,
            offset_table: Some(table.clone()),
            offset_key: key.to_vec(),
            offset_time: time,
        }
    }

    /// Transition `Draining -> Committed`: the drain is complete and the
    /// proposed checkpoint becomes the committed one.
    pub fn new_committed(&self) -> Result<Self> {
        if self.proposed_time.is_zero() {
            return Err(Error::StampState("new_committed"));
        }
        Ok(Self {
            committed_time: self.proposed_time,
            ..Self::default()
        })
    }

    /// True when a drain is in flight.
    pub fn in_progress(&self) -> bool {
        !self.proposed_time.is_zero()
    }

    /// Progress order: committed first, then proposed. Offsets are scan
    /// details and do not participate.
    pub fn order_key(&self) -> (Hlc, Hlc) {
        (self.committed_time, self.proposed_time)
    }
}

impl std::fmt::Display for ResolvedStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.in_progress() {
            write!(f, "committed={} proposed={}", self.committed_time, self.proposed_time)
        } else {
            write!(f, "committed={}", self.committed_time)
        }
    }
}
