//! Transaction-id stability under the recovered checkpoint snapshot.

use tusk_types::TxnId;

use crate::engine::Engine;

/// Whether a transaction id is stable under the current snapshot.
///
/// Outside recovery every id is stable: there is no snapshot to check
/// against. During recovery, only a full checkpoint writes the metadata with
/// a snapshot; if none was recovered, every id is stable. Otherwise standard
/// snapshot visibility applies.
#[must_use]
pub fn txn_visible_id(engine: &Engine, id: TxnId) -> bool {
    if !engine.recovering() {
        return true;
    }
    if engine.recovery_snapshot.is_empty() {
        return true;
    }
    engine.recovery_snapshot.visible_id(id)
}

/// Whether recovery is active and `id` is at or above the recovered snapshot
/// minimum. Pages and objects carrying such ids must be processed during
/// recovery even when their timestamps look stable.
#[must_use]
pub fn check_recovery_flag_txnid(engine: &Engine, id: TxnId) -> bool {
    engine.recovering() && id >= engine.recovery_snapshot.snap_min
}
