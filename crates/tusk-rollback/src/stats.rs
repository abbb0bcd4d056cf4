//! Rollback pass statistics.

/// Counters accumulated over one rollback pass and returned to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtsStats {
    /// In-memory updates aborted.
    pub upd_aborted: u64,
    /// History store entries removed.
    pub hs_removed: u64,
    /// Updates restored from the history store.
    pub hs_restore_updates: u64,
    /// Tombstones restored from the history store.
    pub hs_restore_tombstones: u64,
    /// Keys removed because no stable version existed anywhere.
    pub keys_removed: u64,
    /// Keys whose on-disk value was resurrected over an unstable removal.
    pub keys_restored: u64,
    /// History store keys swept during the final pass on the history store.
    pub sweep_hs_keys: u64,
    /// Leaf pages processed.
    pub pages_visited: u64,
    /// Pages the tree walk skipped without reading.
    pub tree_walk_skip_pages: u64,
    /// RLE runs cut short because the on-disk value proved stable.
    pub stable_rle_skipped: u64,
    /// RLE runs skipped because the cell was a deleted run.
    pub delete_rle_skipped: u64,
    /// Whole-btree history store truncations (non-timestamped objects).
    pub hs_btree_truncated: u64,
    /// Fast-truncated child refs rolled back.
    pub fast_truncate_rolled_back: u64,
    /// Objects whose checkpoint carried transactions newer than the
    /// recovered snapshot minimum.
    pub inconsistent_ckpt: u64,
    /// Trees processed by the walker.
    pub trees_rolled_back: u64,
    /// Trees skipped without a walk.
    pub trees_skipped: u64,
}
