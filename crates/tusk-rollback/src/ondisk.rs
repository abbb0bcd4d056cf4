//! On-disk value repair: when a key's chain has no stable update and the
//! on-disk cell itself is unstable, rebuild the visible version from the
//! history store (or synthesize a tombstone) and hand it back for the caller
//! to prepend to the key's chain.

use tracing::{debug, trace};

use tusk_error::Result;
use tusk_types::{
    apply_modify, HsEntry, HsKey, HsValue, TimeWindow, Timestamp, TxnId, Update, UpdateFlags,
    UpdateKind,
};

use crate::context::{RtsContext, TreeRef};
use crate::hs_cursor::HsCursor;
use crate::visibility::txn_visible_id;

/// Outcome of examining one on-disk cell.
pub(crate) enum OndiskFix {
    /// The cell is stable; nothing to do, and an RLE run sharing it needs no
    /// further per-record work.
    Stable,
    /// Nothing to install for this cell (history store sweep found it clean).
    Keep,
    /// Prepend this chain to the key's update list.
    Install(Box<Update>),
}

/// Examine the on-disk cell for one key and decide how to repair it.
///
/// For the history store's own tree, an entry whose stop is unstable (or
/// missing, which marks it as belonging to a prepared transaction) is
/// tombstoned; there is no older store to consult.
pub(crate) fn abort_ondisk_cell(
    cx: &mut RtsContext<'_>,
    tree: TreeRef,
    key: &[u8],
    value: &[u8],
    tw: &TimeWindow,
) -> Result<OndiskFix> {
    let stable_timestamp = cx.stable_timestamp;
    let prepared = tw.prepare;

    if tree.is_hs {
        if tw.durable_stop_ts > stable_timestamp || tw.stop_ts == Timestamp::MAX {
            debug!(
                durable_start_ts = %tw.durable_start_ts,
                start_ts = %tw.start_ts,
                durable_stop_ts = %tw.durable_stop_ts,
                stop_ts = %tw.stop_ts,
                stable_ts = %stable_timestamp,
                "history store update aborted"
            );
            cx.stats.sweep_hs_keys += 1;
            return Ok(OndiskFix::Install(Update::alloc_tombstone()));
        }
        return Ok(OndiskFix::Keep);
    }

    if tw.durable_start_ts > stable_timestamp
        || !txn_visible_id(cx.engine, tw.start_txn)
        || (!tw.has_stop() && prepared)
    {
        debug!(
            durable_start_ts = %tw.durable_start_ts,
            start_ts = %tw.start_ts,
            txn_id = %tw.start_txn,
            prepared,
            stable_ts = %stable_timestamp,
            "on-disk update aborted"
        );
        if cx.engine.in_memory() {
            // No history store to provide a stable version: remove the key.
            cx.stats.keys_removed += 1;
            return Ok(OndiskFix::Install(Update::alloc_tombstone()));
        }
        return Ok(OndiskFix::Install(ondisk_fixup_key(cx, tree, key, value, tw)?));
    }

    if tw.has_stop()
        && (tw.durable_stop_ts > stable_timestamp
            || !txn_visible_id(cx.engine, tw.stop_txn)
            || prepared)
    {
        // A prepared transaction can leave identical start and stop windows
        // on the cell; only the history store can say what was visible
        // before it.
        if tw.start_ts == tw.stop_ts
            && tw.durable_start_ts == tw.durable_stop_ts
            && tw.start_txn == tw.stop_txn
        {
            debug_assert!(prepared);
            if cx.engine.in_memory() {
                cx.stats.keys_removed += 1;
                return Ok(OndiskFix::Install(Update::alloc_tombstone()));
            }
            return Ok(OndiskFix::Install(ondisk_fixup_key(cx, tree, key, value, tw)?));
        }

        // The removal is unstable but the underlying value is not: clear the
        // removal by re-installing the on-disk value as a standard update.
        let mut upd = Update::alloc(value.to_vec(), UpdateKind::Standard);
        upd.txn_id = if cx.recovering() {
            TxnId::NONE
        } else {
            tw.start_txn
        };
        upd.durable_ts = tw.durable_start_ts;
        upd.start_ts = tw.start_ts;
        upd.flags.insert(UpdateFlags::RESTORED_FROM_DS);
        cx.stats.keys_restored += 1;
        debug!(
            start_ts = %upd.start_ts,
            durable_ts = %upd.durable_ts,
            txn_id = %upd.txn_id,
            removed_stop_ts = %tw.stop_ts,
            removed_durable_stop_ts = %tw.durable_stop_ts,
            prepared,
            "key restored"
        );
        return Ok(OndiskFix::Install(upd));
    }

    Ok(OndiskFix::Stable)
}

/// Replace an unstable on-disk value with an update that satisfies the
/// stable timestamp.
///
/// Walks this key's history store versions newest-first, materializing the
/// value (modify deltas are applied against the running full value) and
/// removing unstable entries, until a version that is stable under the
/// timestamp and the recovered snapshot is found. The found version is
/// promoted out of the history store onto the update chain, together with
/// its stop-side tombstone when that is itself stable. If no version
/// qualifies, the key is removed with a tombstone.
fn ondisk_fixup_key(
    cx: &mut RtsContext<'_>,
    tree: TreeRef,
    key: &[u8],
    ondisk_value: &[u8],
    ondisk_tw: &TimeWindow,
) -> Result<Box<Update>> {
    let engine = cx.engine;
    let stable_timestamp = cx.stable_timestamp;
    let recovering = cx.recovering();

    let mut full_value = ondisk_value.to_vec();
    let mut newer_hs_durable_ts = ondisk_tw.durable_start_ts;
    let mut valid: Option<(HsKey, HsEntry)> = None;

    {
        let mut hs = engine.hs.lock();
        let mut cursor = HsCursor::new(&mut hs);
        let mut first_record = true;

        let mut at = cursor.search_before(tree.id, key);
        while let Some((hs_key, entry)) = at {
            let hs_start_ts = hs_key.start_ts;

            // Entries newer than the on-disk value only contribute modify
            // context when the on-disk update is prepared; the on-disk value
            // in the history store is always a full update, so skipping them
            // is safe and avoids useless work.
            if hs_start_ts <= ondisk_tw.start_ts || ondisk_tw.prepare {
                match &entry.value {
                    HsValue::Modify(ops) => apply_modify(&mut full_value, ops),
                    HsValue::Standard(v) => full_value.clone_from(v),
                }
            } else {
                trace!(
                    start_ts = %hs_start_ts,
                    durable_ts = %entry.durable_ts(),
                    stop_ts = %entry.stop_durable_ts(),
                    "history store update more recent than on-disk update"
                );
            }

            // The start of the current record serves as the stop of the
            // next older record; out-of-order commit timestamps are the only
            // legitimate exception.
            debug_assert!(
                entry.stop_durable_ts() <= newer_hs_durable_ts
                    || hs_start_ts == entry.stop_durable_ts()
                    || hs_start_ts == newer_hs_durable_ts
                    || first_record
            );

            let hs_tw = entry.tw;
            if txn_visible_id(engine, hs_tw.start_txn) && entry.durable_ts() <= stable_timestamp {
                debug!(
                    start_ts = %hs_start_ts,
                    durable_ts = %entry.durable_ts(),
                    stop_ts = %entry.stop_durable_ts(),
                    stable_ts = %stable_timestamp,
                    txn_id = %hs_tw.start_txn,
                    "history store update valid"
                );
                debug_assert!(ondisk_tw.prepare || hs_tw.start_ts <= ondisk_tw.start_ts);
                valid = Some((hs_key, entry));
                break;
            }

            debug!(
                start_ts = %hs_start_ts,
                durable_ts = %entry.durable_ts(),
                stop_ts = %entry.stop_durable_ts(),
                stable_ts = %stable_timestamp,
                start_txn = %hs_tw.start_txn,
                stop_txn = %hs_tw.stop_txn,
                "history store update aborted"
            );
            newer_hs_durable_ts = entry.durable_ts();
            first_record = false;

            cursor.remove()?;
            cx.stats.hs_removed += 1;
            at = cursor.prev();
        }

        // The anchor version moves out of the history store onto the chain.
        if valid.is_some() {
            cursor.remove()?;
            cx.stats.hs_removed += 1;
        }
    }

    let Some((_, entry)) = valid else {
        cx.stats.keys_removed += 1;
        debug!(key_len = key.len(), "key removed");
        return Ok(Update::alloc_tombstone());
    };

    let hs_tw = entry.tw;
    debug_assert!(hs_tw.start_ts < ondisk_tw.start_ts || hs_tw.start_txn < ondisk_tw.start_txn);

    let mut upd = Update::alloc(full_value, UpdateKind::Standard);
    // Scrub transaction ids under recovery: the write generation is
    // re-initialized after rollback and cached ids would be meaningless.
    upd.txn_id = if recovering { TxnId::NONE } else { hs_tw.start_txn };
    upd.durable_ts = hs_tw.durable_start_ts;
    upd.start_ts = hs_tw.start_ts;
    upd.flags.insert(UpdateFlags::RESTORED_FROM_HS);
    cx.stats.hs_restore_updates += 1;
    debug!(
        txn_id = %upd.txn_id,
        start_ts = %upd.start_ts,
        durable_ts = %upd.durable_ts,
        "update restored from history store"
    );

    // A stable stop on the anchor means the key was deleted at or before the
    // stable timestamp: restore that tombstone too.
    if hs_tw.has_stop()
        && txn_visible_id(engine, hs_tw.stop_txn)
        && hs_tw.durable_stop_ts <= stable_timestamp
    {
        debug_assert!(
            hs_tw.durable_stop_ts.is_none()
                || hs_tw.durable_stop_ts < newer_hs_durable_ts
                || ondisk_tw.prepare
        );
        let mut tombstone = Update::alloc_tombstone();
        tombstone.txn_id = if recovering { TxnId::NONE } else { hs_tw.stop_txn };
        tombstone.durable_ts = hs_tw.durable_stop_ts;
        tombstone.start_ts = hs_tw.stop_ts;
        tombstone.flags.insert(UpdateFlags::RESTORED_FROM_HS);
        cx.stats.hs_restore_tombstones += 1;
        debug!(
            txn_id = %tombstone.txn_id,
            start_ts = %tombstone.start_ts,
            durable_ts = %tombstone.durable_ts,
            "tombstone restored from history store"
        );
        tombstone.next = Some(upd);
        return Ok(tombstone);
    }

    Ok(upd)
}
