//! The transaction snapshot recovered from the last full checkpoint.

use crate::time::TxnId;

/// Snapshot `(min, max, id list)` written by a full checkpoint and recovered
/// at startup. Only full checkpoints carry one; an empty snapshot (min and
/// max both none) means every transaction id is treated as visible.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSnapshot {
    pub snap_min: TxnId,
    pub snap_max: TxnId,
    /// Ids that were running when the snapshot was taken, ascending.
    pub snapshot: Vec<TxnId>,
}

impl CheckpointSnapshot {
    /// Whether no snapshot was recovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snap_min.is_none() && self.snap_max.is_none()
    }

    /// Standard snapshot visibility: ids below the minimum are visible, ids
    /// at or above the maximum are not, ids in between are visible unless
    /// they were running when the snapshot was taken.
    #[must_use]
    pub fn visible_id(&self, id: TxnId) -> bool {
        if id < self.snap_min {
            return true;
        }
        if id >= self.snap_max {
            return false;
        }
        self.snapshot.binary_search(&id).is_err()
    }
}
