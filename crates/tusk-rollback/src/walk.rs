//! Tree walking: visit the refs of a B-tree, skipping pages that provably
//! cannot contain unstable data.

use tracing::{debug, trace};

use tusk_error::{Result, TuskError};
use tusk_types::{
    Addr, PageBody, ReadFlags, RecResult, Ref, RefState, TimeAggregate, Timestamp, TxnId,
};

use crate::context::{RtsContext, TreeRef};
use crate::page::{rollback_fast_truncate, rollback_ref_page};
use crate::visibility::check_recovery_flag_txnid;

/// The aggregated max durable timestamp of a block address.
///
/// For the history store the newest stop commit timestamp joins the
/// calculation: most history store updates stop at or after they start,
/// except those written for prepared data-store updates, which have no
/// durable stop at all.
pub(crate) fn ref_max_durable_timestamp(is_hs: bool, ta: &TimeAggregate) -> Timestamp {
    if is_hs {
        ta.newest_stop_durable_ts.max(ta.newest_stop_ts)
    } else {
        ta.newest_start_durable_ts.max(ta.newest_stop_durable_ts)
    }
}

/// Whether the page behind `r` can contain modifications newer than the
/// stable timestamp.
///
/// Examined in priority order: the reconciled replacement block, the
/// reconciled multi-block set, then the block address. Address checks
/// additionally trigger during recovery when the newest transaction id
/// reaches the recovered snapshot minimum.
pub(crate) fn page_needs_abort(cx: &RtsContext<'_>, tree: TreeRef, r: &Ref) -> bool {
    let stable_timestamp = cx.stable_timestamp;
    let mut durable_ts = Timestamp::NONE;
    let mut newest_txn = TxnId::NONE;
    let mut prepared = false;
    let mut tag = "undefined state";
    let mut result = false;

    let rec_result = r
        .page
        .as_ref()
        .and_then(|p| p.modify.as_ref())
        .and_then(|m| m.rec_result.as_ref());

    match (rec_result, &r.addr) {
        (Some(RecResult::Replace(addr)), _) => {
            tag = "reconciled replace block";
            durable_ts = ref_max_durable_timestamp(tree.is_hs, &addr.ta);
            prepared = addr.ta.prepare;
            result = durable_ts > stable_timestamp || prepared;
        }
        (Some(RecResult::Multi(addrs)), _) => {
            tag = "reconciled multi block";
            for Addr { ta } in addrs {
                durable_ts = durable_ts.max(ref_max_durable_timestamp(tree.is_hs, ta));
                if ta.prepare {
                    prepared = true;
                }
            }
            result = durable_ts > stable_timestamp || prepared;
        }
        (None, Some(addr)) => {
            tag = "address";
            durable_ts = ref_max_durable_timestamp(tree.is_hs, &addr.ta);
            prepared = addr.ta.prepare;
            newest_txn = addr.ta.newest_txn;
            result = durable_ts > stable_timestamp
                || prepared
                || check_recovery_flag_txnid(cx.engine, newest_txn);
        }
        (None, None) => {}
    }

    debug!(
        tag,
        durable_ts = %durable_ts,
        newest_txn = %newest_txn,
        prepared,
        "page aggregate examined"
    );
    result
}

/// Read a disk-state page for rollback. Eviction is disabled for the read
/// and the page is marked as not needed again.
fn page_read(r: &mut Ref) -> Result<()> {
    let flags = ReadFlags::NO_EVICT | ReadFlags::WONT_NEED;
    trace!(flags = ?flags, "page read for rollback");
    if r.page.is_none() {
        return Err(TuskError::internal(
            "disk ref without a readable backing image",
        ));
    }
    r.state = RefState::InMemory;
    Ok(())
}

/// Walk the tree depth-first, aborting unstable commits.
///
/// Disk refs whose aggregates prove stable are skipped without a read.
/// Resident pages are always examined: they may hold updates not yet
/// reflected in any address aggregate.
pub(crate) fn walk_tree(cx: &mut RtsContext<'_>, tree: TreeRef, root: &mut Ref) -> Result<()> {
    walk_ref(cx, tree, root)
}

fn walk_ref(cx: &mut RtsContext<'_>, tree: TreeRef, r: &mut Ref) -> Result<()> {
    match r.state {
        // Fast-truncated children are examined from their parent.
        RefState::Deleted => return Ok(()),
        RefState::Disk => {
            if !page_needs_abort(cx, tree, r) {
                trace!("page walk skipped");
                cx.stats.tree_walk_skip_pages += 1;
                return Ok(());
            }
            page_read(r)?;
        }
        RefState::InMemory => {}
    }

    let is_internal = r.page.as_ref().is_some_and(|p| p.is_internal());
    if is_internal {
        if let Some(page) = r.page.as_mut() {
            if let PageBody::Internal(internal) = &mut page.body {
                rollback_fast_truncate(cx, internal)?;
                for child in &mut internal.children {
                    walk_ref(cx, tree, child)?;
                }
            }
        }
        Ok(())
    } else {
        rollback_ref_page(cx, tree, r)
    }
}
