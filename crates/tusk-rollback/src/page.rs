//! Per-page rollback: dispatch over the four page layouts.
//!
//! Leaf pages get their update chains aborted and their on-disk cells
//! repaired; internal pages get unstable fast-truncations rolled back.

use tracing::{debug, trace};

use tusk_error::{Result, TuskError};
use tusk_types::{
    recno_key, update::prepend_chain, CellKind, ColFixPage, ColVarPage, InsertList, InternalPage,
    PageBody, Ref, RefState, RowLeafPage,
};

use crate::chain::abort_update_chain;
use crate::context::{RtsContext, TreeRef};
use crate::ondisk::{abort_ondisk_cell, OndiskFix};
use crate::walk::page_needs_abort;

/// Abort unstable updates on a page the walker selected.
///
/// A clean page may still hold modifications needing rollback: eviction
/// writes the newest version to the page image, so the aggregate check runs
/// even for refs whose page is resident and unmodified.
pub(crate) fn rollback_ref_page(cx: &mut RtsContext<'_>, tree: TreeRef, r: &mut Ref) -> Result<()> {
    let modified = r.page.as_ref().is_some_and(|p| p.is_modified());
    if !modified && !page_needs_abort(cx, tree, r) {
        trace!("page skipped");
        return Ok(());
    }

    cx.stats.pages_visited += 1;
    debug!(modified, "page rolled back");

    let page = r
        .page
        .as_mut()
        .ok_or_else(|| TuskError::internal("resident ref without a page image"))?;

    match &mut page.body {
        PageBody::RowLeaf(leaf) => rollback_row_leaf(cx, tree, leaf)?,
        PageBody::ColVar(leaf) => rollback_col_var(cx, tree, leaf)?,
        PageBody::ColFix(leaf) => rollback_col_fix(cx, tree, leaf)?,
        // Internal pages only carry structure; fast truncate is handled as
        // the walker descends.
        PageBody::Internal(_) => return Ok(()),
    }

    page.mark_dirty();
    Ok(())
}

/// Apply the chain abort to each entry of a row insert list. Returns the
/// stability verdict of the last chain processed.
fn abort_insert_list_row(
    cx: &mut RtsContext<'_>,
    tree: TreeRef,
    list: &mut InsertList<Vec<u8>>,
) -> Result<bool> {
    let mut stable_update_found = false;
    for entry in &mut list.entries {
        if entry.upd.is_some() {
            stable_update_found = abort_update_chain(cx, tree, &entry.key, &mut entry.upd)?;
        }
    }
    Ok(stable_update_found)
}

/// Apply the chain abort to each entry of a column insert list. Record
/// numbers are packed into key bytes for the history store operations.
fn abort_insert_list_col(
    cx: &mut RtsContext<'_>,
    tree: TreeRef,
    list: &mut InsertList<u64>,
) -> Result<bool> {
    let mut stable_update_found = false;
    for entry in &mut list.entries {
        if entry.upd.is_some() {
            let key = recno_key(entry.key);
            stable_update_found = abort_update_chain(cx, tree, &key, &mut entry.upd)?;
        }
    }
    Ok(stable_update_found)
}

/// Roll back a row-store leaf page.
fn rollback_row_leaf(cx: &mut RtsContext<'_>, tree: TreeRef, page: &mut RowLeafPage) -> Result<()> {
    // Keys inserted before the first on-disk key.
    abort_insert_list_row(cx, tree, &mut page.insert_smallest)?;

    for row in &mut page.rows {
        let mut stable_update_found = false;
        if row.upd.is_some() {
            stable_update_found = abort_update_chain(cx, tree, &row.key, &mut row.upd)?;
        }

        abort_insert_list_row(cx, tree, &mut row.insert)?;

        // Without a stable in-memory update the on-disk value itself decides.
        if !stable_update_found {
            if let Some(cell) = row.ondisk.clone() {
                match abort_ondisk_cell(cx, tree, &row.key, &cell.value, &cell.tw)? {
                    OndiskFix::Install(chain) => prepend_chain(&mut row.upd, chain),
                    OndiskFix::Stable | OndiskFix::Keep => {}
                }
            }
        }
    }
    Ok(())
}

/// Roll back a variable-width column-store leaf page.
fn rollback_col_var(cx: &mut RtsContext<'_>, tree: TreeRef, page: &mut ColVarPage) -> Result<()> {
    let mut recno = if page.has_disk_image {
        page.start_recno
    } else {
        0
    };

    for at in 0..page.cells.len() {
        let stable_update_found = abort_insert_list_col(cx, tree, &mut page.cells[at].update)?;

        let ondisk = page.cells[at].ondisk.clone();
        let span = ondisk.as_ref().map_or(1, |c| c.rle.max(1));

        if !stable_update_found && page.has_disk_image {
            if let Some(cell) = &ondisk {
                if cell.kind == CellKind::Deleted {
                    // A deleted run carries nothing to roll back.
                    cx.stats.delete_rle_skipped += 1;
                } else {
                    for offset in 0..span {
                        let key = recno_key(recno + offset);
                        match abort_ondisk_cell(cx, tree, &key, &cell.value, &cell.tw)? {
                            OndiskFix::Install(chain) => {
                                let entry = page.cells[at].update.entry_mut(recno + offset);
                                prepend_chain(&mut entry.upd, chain);
                            }
                            OndiskFix::Stable => {
                                // One stable verdict covers the whole run.
                                if span > 1 {
                                    cx.stats.stable_rle_skipped += 1;
                                }
                                break;
                            }
                            OndiskFix::Keep => {}
                        }
                    }
                }
            }
        }
        recno += span;
    }

    abort_insert_list_col(cx, tree, &mut page.append)?;
    Ok(())
}

/// Roll back a fixed-width column-store leaf page.
fn rollback_col_fix(cx: &mut RtsContext<'_>, tree: TreeRef, page: &mut ColFixPage) -> Result<()> {
    abort_insert_list_col(cx, tree, &mut page.update)?;
    abort_insert_list_col(cx, tree, &mut page.append)?;
    Ok(())
}

/// Roll back unstable fast-truncations on an internal page's children.
///
/// A fast-truncated child is either still in deleted state, where the
/// descriptor carries the timestamps, or was instantiated into per-key
/// updates, which the leaf visit handles. Only the first case is examined
/// here.
pub(crate) fn rollback_fast_truncate(cx: &mut RtsContext<'_>, page: &mut InternalPage) -> Result<()> {
    for child in &mut page.children {
        if child.state != RefState::Deleted {
            continue;
        }
        let Some(del) = &child.page_del else {
            continue;
        };
        if cx.stable_timestamp < del.durable_timestamp {
            debug!(durable_ts = %del.durable_timestamp, "deleted page rolled back");
            child.state = del.previous_state;
            child.page_del = None;
            cx.stats.fast_truncate_rolled_back += 1;
        }
    }
    Ok(())
}
