//! Update-chain editing: abort unstable updates, locate the stable anchor,
//! and trim the history store above it.

use tracing::trace;

use tusk_error::Result;
use tusk_types::{Timestamp, TxnId, Update, UpdateFlags, UpdateKind};

use crate::context::{RtsContext, TreeRef};
use crate::hs_cursor::HsCursor;

/// Delete this key's history store entries whose start timestamp is at or
/// above `ts`, walking backwards from the newest version.
pub(crate) fn delete_hs(cx: &mut RtsContext<'_>, tree: TreeRef, key: &[u8], ts: Timestamp) -> Result<()> {
    let mut hs = cx.engine.hs.lock();
    let mut cursor = HsCursor::new(&mut hs);

    let mut at = cursor.search_before(tree.id, key);
    while let Some((hs_key, _)) = at {
        if hs_key.start_ts < ts {
            break;
        }
        cursor.remove()?;
        cx.stats.hs_removed += 1;
        at = cursor.prev();
    }
    Ok(())
}

/// Abort updates on one key's chain with durable timestamps newer than the
/// stable timestamp, along with any prepared updates. Returns whether a
/// stable update survives.
///
/// If the surviving update has a history store counterpart, the counterpart
/// and everything newer is deleted from the history store and the flag is
/// cleared so the update is re-inserted with a fresh stop time on the next
/// checkpoint.
pub(crate) fn abort_update_chain(
    cx: &mut RtsContext<'_>,
    tree: TreeRef,
    key: &[u8],
    head: &mut Option<Box<Update>>,
) -> Result<bool> {
    let stable_timestamp = cx.stable_timestamp;

    // Abort the unstable prefix of the chain in place.
    let mut stable_found = false;
    let mut cur = head.as_deref_mut();
    while let Some(u) = cur {
        if u.is_aborted() {
            cur = u.next.as_deref_mut();
            continue;
        }
        if stable_timestamp < u.durable_ts
            || u.prepare_state == tusk_types::PrepareState::InProgress
        {
            trace!(
                txn_id = %u.txn_id,
                durable_ts = %u.durable_ts,
                stable_ts = %stable_timestamp,
                prepared = u.prepare_state == tusk_types::PrepareState::InProgress,
                "update aborted"
            );
            u.txn_id = TxnId::ABORTED;
            u.durable_ts = Timestamp::NONE;
            u.start_ts = Timestamp::NONE;
            cx.stats.upd_aborted += 1;
            cur = u.next.as_deref_mut();
            continue;
        }
        stable_found = true;
        break;
    }
    if !stable_found {
        return Ok(false);
    }

    // If the stable update has a history store counterpart, the counterpart
    // and everything newer must go: the update will be moved to the history
    // store again with a different stop time on the next checkpoint.
    let (first_is_tombstone, first_has_hs, anchor_ts) = match first_live(head.as_deref()) {
        Some(first) => {
            let mut anchor_ts = first.start_ts;
            let first_is_tombstone = first.kind == UpdateKind::Tombstone;
            if first_is_tombstone {
                // The update following a stable tombstone, when present, is
                // the version the tombstone deleted; it is the true anchor.
                if let Some(succ) = first_live(first.next.as_deref()) {
                    debug_assert!(succ.kind != UpdateKind::Tombstone);
                    debug_assert!(succ.flags.contains(UpdateFlags::HS));
                    anchor_ts = succ.start_ts;
                }
            }
            (
                first_is_tombstone,
                first.flags.contains(UpdateFlags::HS),
                anchor_ts,
            )
        }
        None => {
            debug_assert!(false, "stable update found but chain has no live entry");
            return Ok(true);
        }
    };

    if first_has_hs {
        delete_hs(cx, tree, key, anchor_ts)?;

        // Clear the counterpart flag on the stable update (and the update
        // past a stable tombstone) so it is not skipped as already-present
        // when it next moves to the history store.
        let mut clear_successor = first_is_tombstone;
        let mut cur = head.as_deref_mut();
        while let Some(u) = cur {
            if !u.is_aborted() {
                let was_tombstone = u.kind == UpdateKind::Tombstone;
                u.flags.remove(UpdateFlags::HS);
                if clear_successor && was_tombstone {
                    clear_successor = false;
                    cur = u.next.as_deref_mut();
                    continue;
                }
                break;
            }
            cur = u.next.as_deref_mut();
        }
    }

    Ok(true)
}

fn first_live(mut cur: Option<&Update>) -> Option<&Update> {
    while let Some(u) = cur {
        if !u.is_aborted() {
            return Some(u);
        }
        cur = u.next.as_deref();
    }
    None
}
