//! Per-object rollback: read checkpoint metadata, decide whether the tree
//! needs a walk, and truncate the history store for non-timestamped objects.

use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use tusk_error::{Result, TuskError};

use crate::context::{RtsContext, TreeRef};
use crate::engine::{Btree, ConnFlags, SessionFlags, HS_URI, METAFILE_URI};
use crate::hs_cursor::HsCursor;
use crate::meta::CheckpointMeta;
use crate::visibility::check_recovery_flag_txnid;
use crate::walk::walk_tree;

/// How often the catalog scan reports progress.
const PROGRESS_MSG_PERIOD: Duration = Duration::from_secs(20);

/// Walk one tree, wiping unstable commits.
///
/// Immediately durable trees keep their commits: their records are logged
/// synchronously and would be recovered after a crash anyway, so wiping them
/// here would leave the log and the tree inconsistent. Checkpoint handles
/// and empty trees have nothing to do.
pub(crate) fn rollback_to_stable_btree(cx: &mut RtsContext<'_>, tree: &mut Btree) -> Result<()> {
    if tree.immediately_durable {
        debug!(btree_id = tree.id, "skipping immediately durable tree");
        return Ok(());
    }
    if tree.checkpoint.is_some() {
        return Ok(());
    }
    let Some(root) = tree.root.as_deref_mut() else {
        return Ok(());
    };

    cx.stats.trees_rolled_back += 1;
    let tref = TreeRef {
        id: tree.id,
        is_hs: tree.is_hs,
    };
    walk_tree(cx, tref, root)
}

/// Wipe all history store updates for one btree (non-timestamped objects
/// keep nothing in the history store).
pub(crate) fn hs_truncate(cx: &mut RtsContext<'_>, btree_id: u32) -> Result<()> {
    debug!(btree_id, "history store truncation for non-timestamped object");

    let mut hs = cx.engine.hs.lock();
    let mut cursor = HsCursor::new(&mut hs);
    let mut at = cursor.search_after(btree_id);
    while let Some((hs_key, _)) = at {
        debug_assert_eq!(hs_key.btree_id, btree_id);
        trace!(start_ts = %hs_key.start_ts, "history store cleanup of update");
        cursor.remove()?;
        cx.stats.hs_removed += 1;
        at = cursor.next();
    }
    drop(hs);

    cx.stats.hs_btree_truncated += 1;
    Ok(())
}

/// Perform rollback to stable on a single object.
pub(crate) fn rollback_to_stable_btree_apply(
    cx: &mut RtsContext<'_>,
    uri: &str,
    config: &str,
) -> Result<()> {
    // Non-file objects, the metadata, and the history store are handled
    // elsewhere.
    if !uri.starts_with("file:") || uri == HS_URI || uri == METAFILE_URI {
        return Ok(());
    }

    let stable_timestamp = cx.stable_timestamp;
    let meta = CheckpointMeta::parse(uri, config)?;
    let max_durable_ts = meta.max_durable_ts();
    let has_recovery_txn = check_recovery_flag_txnid(cx.engine, meta.newest_txn);
    if has_recovery_txn {
        cx.stats.inconsistent_ckpt += 1;
    }

    // During recovery and shutdown, empty trees have nothing to roll back,
    // and timestamped trees with no stable timestamp set cannot be brought
    // anywhere meaningful.
    let recovering_or_closing = cx
        .engine
        .conn_flags
        .intersects(ConnFlags::RECOVERING | ConnFlags::CLOSING_TIMESTAMP);
    if recovering_or_closing
        && (meta.addr_len == 0 || (stable_timestamp.is_none() && !max_durable_ts.is_none()))
    {
        debug!(
            uri,
            reason = if meta.addr_len == 0 {
                "checkpoint address length is 0"
            } else {
                "timestamped updates with no stable timestamp"
            },
            "skipping rollback to stable"
        );
        cx.stats.trees_skipped += 1;
        return Ok(());
    }

    let cached_and_modified = {
        let trees = cx.engine.trees.read();
        trees.get(uri).is_some_and(|t| t.open && t.modified)
    };

    let perform_rts = cached_and_modified
        || max_durable_ts > stable_timestamp
        || meta.prepare
        || !meta.durable_ts_found
        || has_recovery_txn;

    let mut dhandle_allocated = false;
    if perform_rts {
        let mut trees = cx.engine.trees.write();
        let tree = trees
            .get_mut(uri)
            .ok_or_else(|| TuskError::not_found(uri))?;
        if tree.exclusive_busy {
            return Err(TuskError::busy(uri));
        }
        tree.open = true;
        dhandle_allocated = true;

        debug!(
            uri,
            max_durable_ts = %max_durable_ts,
            modified = tree.modified,
            prepared = meta.prepare,
            durable_ts_found = meta.durable_ts_found,
            newest_txn = %meta.newest_txn,
            has_recovery_txn,
            "tree rolled back"
        );
        rollback_to_stable_btree(cx, tree)?;
    } else {
        debug!(
            uri,
            max_durable_ts = %max_durable_ts,
            stable_ts = %stable_timestamp,
            newest_txn = %meta.newest_txn,
            "tree skipped"
        );
        cx.stats.trees_skipped += 1;
    }

    // Truncate history store entries for non-timestamped objects. A modified
    // tree can be a timestamped tree that was never checkpointed, so its
    // zero durable timestamp proves nothing; and an in-memory engine has no
    // history store at all.
    let tree_modified = {
        let trees = cx.engine.trees.read();
        trees.get(uri).is_some_and(|t| t.modified)
    };
    if (!dhandle_allocated || !tree_modified)
        && max_durable_ts.is_none()
        && !cx.engine.in_memory()
    {
        let btree_id = meta
            .id
            .ok_or_else(|| TuskError::invalid_config(format!("{uri}: missing btree id")))?;
        hs_truncate(cx, btree_id)?;
    }

    Ok(())
}

/// Final pass over the history store itself, removing entries newer than the
/// stable timestamp. Only run during recovery.
pub(crate) fn hs_final_pass(cx: &mut RtsContext<'_>) -> Result<()> {
    let config = cx
        .engine
        .catalog
        .get(HS_URI)
        .ok_or_else(|| TuskError::not_found(HS_URI))?
        .to_owned();
    let meta = CheckpointMeta::parse(HS_URI, &config)?;

    // Most history store updates stop at or after their start; the ones
    // written for prepared data-store updates carry no durable stop, so the
    // newest stop commit timestamp joins the calculation.
    let max_durable_ts = meta.newest_stop_durable_ts.max(meta.newest_stop_ts);

    let mut trees = cx.engine.trees.write();
    let tree = trees
        .get_mut(HS_URI)
        .ok_or_else(|| TuskError::not_found(HS_URI))?;
    tree.open = true;

    if max_durable_ts > cx.stable_timestamp {
        debug!(durable_ts = %max_durable_ts, "history store tree rolled back");
        rollback_to_stable_btree(cx, tree)?;
    } else {
        debug!(
            durable_ts = %max_durable_ts,
            stable_ts = %cx.stable_timestamp,
            "history store tree skipped"
        );
    }
    Ok(())
}

/// Perform rollback to stable on every object in the metadata catalog,
/// apart from the metadata and history store files.
pub(crate) fn apply_all(cx: &mut RtsContext<'_>) -> Result<()> {
    let started = Instant::now();
    let mut rollback_count = 0_u64;
    let mut rollback_msg_count = 0_u64;

    for (uri, config) in cx.engine.catalog.snapshot() {
        let elapsed = started.elapsed();
        if elapsed.as_secs() / PROGRESS_MSG_PERIOD.as_secs() > rollback_msg_count {
            info!(
                elapsed_secs = elapsed.as_secs(),
                objects_inspected = rollback_count,
                "rollback to stable in progress"
            );
            rollback_msg_count += 1;
        }
        rollback_count += 1;

        cx.session_flags.insert(SessionFlags::QUIET_CORRUPT_FILE);
        let result = rollback_to_stable_btree_apply(cx, &uri, &config);
        cx.session_flags.remove(SessionFlags::QUIET_CORRUPT_FILE);

        // Objects that vanished or are corrupted (when the engine tolerates
        // corruption) don't stop the pass.
        if let Err(err) = result {
            let tolerate = cx
                .engine
                .conn_flags
                .contains(ConnFlags::DATA_CORRUPTION);
            if err.is_object_skippable(tolerate) {
                warn!(uri, error = %err, "skipped performing rollback to stable");
                continue;
            }
            return Err(err);
        }
    }

    if cx.recovering() {
        hs_final_pass(cx)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use tusk_types::{
        Addr, DiskCell, HsEntry, HsKey, HsValue, InternalPage, Page, PageBody, Ref, RowLeafPage,
        RowSlot, TimeAggregate, TimeWindow, Timestamp, TxnId,
    };

    fn cx_at(engine: &Engine, ts: u64) -> RtsContext<'_> {
        let mut cx = RtsContext::new(engine);
        cx.stable_timestamp = Timestamp::new(ts);
        cx
    }

    fn unstable_leaf_root() -> Ref {
        let ta = TimeAggregate {
            newest_start_durable_ts: Timestamp::new(150),
            ..TimeAggregate::default()
        };
        Ref::in_memory(Page::new(PageBody::Internal(InternalPage {
            children: vec![Ref::on_disk(
                Addr { ta },
                Page::new(PageBody::RowLeaf(RowLeafPage {
                    has_disk_image: true,
                    rows: vec![RowSlot {
                        key: b"k".to_vec(),
                        ondisk: Some(DiskCell {
                            value: b"v".to_vec(),
                            tw: TimeWindow::with_start(
                                Timestamp::new(150),
                                Timestamp::new(150),
                                TxnId::new(1),
                            ),
                        }),
                        upd: None,
                        insert: Default::default(),
                    }],
                    ..RowLeafPage::default()
                })),
            )],
        })))
    }

    fn seed_hs(engine: &Engine, btree_id: u32, n: usize) {
        let mut hs = engine.hs.lock();
        for at in 0..n {
            hs.insert(
                HsKey {
                    btree_id,
                    key: vec![at as u8],
                    start_ts: Timestamp::new(10 + at as u64),
                    counter: 0,
                },
                HsEntry {
                    value: HsValue::Standard(vec![1]),
                    tw: TimeWindow::with_start(
                        Timestamp::new(10),
                        Timestamp::new(10),
                        TxnId::new(1),
                    ),
                },
            );
        }
    }

    #[test]
    fn non_file_and_singleton_uris_are_ignored() {
        let engine = Engine::new(ConnFlags::empty());
        let mut cx = cx_at(&engine, 100);
        rollback_to_stable_btree_apply(&mut cx, "table:users", "id=1").expect("ignored");
        rollback_to_stable_btree_apply(&mut cx, HS_URI, "id=0").expect("ignored");
        rollback_to_stable_btree_apply(&mut cx, METAFILE_URI, "id=0").expect("ignored");
        assert_eq!(cx.stats.trees_rolled_back, 0);
        assert_eq!(cx.stats.trees_skipped, 0);
    }

    #[test]
    fn unstable_durable_ts_triggers_walk() {
        let engine = Engine::new(ConnFlags::empty());
        engine
            .trees
            .write()
            .insert("file:a.tsk".to_owned(), Btree::new(5).with_root(unstable_leaf_root()));
        let mut cx = cx_at(&engine, 100);

        let config = "id=5,checkpoint=(c1=(addr=\"aa\",newest_start_durable_ts=150,newest_stop_durable_ts=0,prepare=0,newest_txn=2))";
        rollback_to_stable_btree_apply(&mut cx, "file:a.tsk", config).expect("apply");
        assert_eq!(cx.stats.trees_rolled_back, 1);
        assert_eq!(cx.stats.keys_removed, 1);
    }

    #[test]
    fn stable_tree_is_skipped() {
        let engine = Engine::new(ConnFlags::empty());
        engine
            .trees
            .write()
            .insert("file:a.tsk".to_owned(), Btree::new(5).with_root(unstable_leaf_root()));
        let mut cx = cx_at(&engine, 100);

        let config = "id=5,checkpoint=(c1=(addr=\"aa\",newest_start_durable_ts=90,newest_stop_durable_ts=0,prepare=0,newest_txn=2))";
        rollback_to_stable_btree_apply(&mut cx, "file:a.tsk", config).expect("apply");
        assert_eq!(cx.stats.trees_rolled_back, 0);
        assert_eq!(cx.stats.trees_skipped, 1);
    }

    #[test]
    fn busy_handle_is_fatal_for_the_object() {
        let engine = Engine::new(ConnFlags::empty());
        let mut tree = Btree::new(5);
        tree.exclusive_busy = true;
        engine.trees.write().insert("file:a.tsk".to_owned(), tree);
        let mut cx = cx_at(&engine, 100);

        let config = "id=5,checkpoint=(c1=(addr=\"aa\",newest_start_durable_ts=150))";
        let err = rollback_to_stable_btree_apply(&mut cx, "file:a.tsk", config)
            .expect_err("busy handle");
        assert!(matches!(err, TuskError::Busy { .. }));
    }

    #[test]
    fn non_timestamped_object_truncates_its_hs_range() {
        let engine = Engine::new(ConnFlags::empty());
        engine
            .trees
            .write()
            .insert("file:a.tsk".to_owned(), Btree::new(5));
        seed_hs(&engine, 5, 3);
        seed_hs(&engine, 6, 2);
        let mut cx = cx_at(&engine, 100);

        // No durable timestamp anywhere: the tree walk runs (durable_ts
        // never found) and the btree's entire history range goes away.
        let config = "id=5,checkpoint=(c1=(addr=\"aa\",prepare=0,newest_txn=2))";
        rollback_to_stable_btree_apply(&mut cx, "file:a.tsk", config).expect("apply");

        assert_eq!(engine.hs.lock().btree_entry_count(5), 0);
        assert_eq!(engine.hs.lock().btree_entry_count(6), 2);
        assert_eq!(cx.stats.hs_btree_truncated, 1);
    }

    #[test]
    fn recovery_skips_empty_trees() {
        let engine = Engine::new(ConnFlags::RECOVERING);
        let mut cx = cx_at(&engine, 100);

        let config = "id=5,checkpoint=(c1=(addr=\"\",newest_start_durable_ts=150))";
        rollback_to_stable_btree_apply(&mut cx, "file:a.tsk", config).expect("apply");
        assert_eq!(cx.stats.trees_skipped, 1);
    }

    #[test]
    fn recovery_skips_timestamped_tree_without_stable() {
        let engine = Engine::new(ConnFlags::RECOVERING);
        let mut cx = cx_at(&engine, 0);

        let config = "id=5,checkpoint=(c1=(addr=\"aa\",newest_start_durable_ts=150))";
        rollback_to_stable_btree_apply(&mut cx, "file:a.tsk", config).expect("apply");
        assert_eq!(cx.stats.trees_skipped, 1);
        assert_eq!(cx.stats.trees_rolled_back, 0);
    }

    // A config the metadata parser rejects as corrupted (truncated
    // checkpoint sub-object).
    const CORRUPT_CONFIG: &str = "id=9,checkpoint=(c1=(addr=\"aa\",newest_start_durable_ts=150)";

    #[test]
    fn apply_all_tolerates_corruption_when_configured() {
        let engine = {
            let mut engine = Engine::new(ConnFlags::DATA_CORRUPTION);
            engine.catalog.insert("file:bad.tsk", CORRUPT_CONFIG);
            engine.catalog.insert(
                "file:good.tsk",
                "id=5,checkpoint=(c1=(addr=\"aa\",\
                 newest_start_durable_ts=150,newest_stop_durable_ts=0,prepare=0,newest_txn=2))",
            );
            engine
                .trees
                .write()
                .insert("file:good.tsk".to_owned(), Btree::new(5).with_root(unstable_leaf_root()));
            engine
        };
        let mut cx = cx_at(&engine, 100);

        // The corrupted object is logged and skipped; the scan still
        // processes the object after it.
        apply_all(&mut cx).expect("apply all");
        assert_eq!(cx.stats.trees_rolled_back, 1);
        assert_eq!(cx.stats.keys_removed, 1);
    }

    #[test]
    fn corruption_aborts_the_pass_without_tolerance() {
        let engine = {
            let mut engine = Engine::new(ConnFlags::empty());
            engine.catalog.insert("file:bad.tsk", CORRUPT_CONFIG);
            engine
        };
        let mut cx = cx_at(&engine, 100);

        let err = apply_all(&mut cx).expect_err("corruption is fatal");
        assert!(matches!(err, TuskError::Corruption { uri, .. } if uri == "file:bad.tsk"));
    }

    #[test]
    fn apply_all_tolerates_missing_objects() {
        let engine = {
            let mut engine = Engine::new(ConnFlags::empty());
            engine.catalog.insert(
                "file:gone.tsk",
                "id=9,checkpoint=(c1=(addr=\"aa\",newest_start_durable_ts=150))",
            );
            engine
        };
        let mut cx = cx_at(&engine, 100);

        // The tree is absent from the tree map: object dropped after the
        // catalog scan. The pass keeps going.
        apply_all(&mut cx).expect("apply all");
    }

    #[test]
    fn immediately_durable_tree_is_not_walked() {
        let engine = Engine::new(ConnFlags::empty());
        let mut tree = Btree::new(5).with_root(unstable_leaf_root());
        tree.immediately_durable = true;
        let mut cx = cx_at(&engine, 100);
        rollback_to_stable_btree(&mut cx, &mut tree).expect("skip");
        assert_eq!(cx.stats.trees_rolled_back, 0);
    }

    #[test]
    fn hs_final_pass_sweeps_unstable_stops() {
        let mut engine = Engine::new(ConnFlags::RECOVERING);
        engine.catalog.insert(
            HS_URI,
            "id=0,checkpoint=(c1=(addr=\"aa\",newest_stop_durable_ts=150,newest_stop_ts=150))",
        );
        let mut hs_tree = Btree::new(0);
        hs_tree.is_hs = true;
        let mut stop_tw = TimeWindow::with_start(Timestamp::new(40), Timestamp::new(40), TxnId::new(1));
        stop_tw.stop_ts = Timestamp::new(150);
        stop_tw.durable_stop_ts = Timestamp::new(150);
        stop_tw.stop_txn = TxnId::new(2);
        let ta = TimeAggregate {
            newest_stop_durable_ts: Timestamp::new(150),
            ..TimeAggregate::default()
        };
        hs_tree.root = Some(Box::new(Ref::in_memory(Page::new(PageBody::Internal(
            InternalPage {
                children: vec![Ref::on_disk(
                    Addr { ta },
                    Page::new(PageBody::RowLeaf(RowLeafPage {
                        has_disk_image: true,
                        rows: vec![RowSlot {
                            key: b"h".to_vec(),
                            ondisk: Some(DiskCell {
                                value: b"v".to_vec(),
                                tw: stop_tw,
                            }),
                            upd: None,
                            insert: Default::default(),
                        }],
                        ..RowLeafPage::default()
                    })),
                )],
            },
        )))));
        engine.trees.write().insert(HS_URI.to_owned(), hs_tree);
        let mut cx = cx_at(&engine, 100);

        hs_final_pass(&mut cx).expect("final pass");
        assert_eq!(cx.stats.sweep_hs_keys, 1);
    }
}
