//! End-to-end rollback scenarios, each driving the full pass through the
//! public entry point against a small single-tree engine.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tusk_rollback::{
    rollback_to_stable, Btree, ConnFlags, Engine, RollbackOptions, RtsStats, HS_URI,
};
use tusk_types::{
    Addr, CheckpointSnapshot, DiskCell, HsEntry, HsKey, HsValue, InternalPage, Page, PageBody,
    PageDelete, Ref, RefState, RowLeafPage, RowSlot, TimeAggregate, TimeWindow, Timestamp, TxnId,
    Update, UpdateFlags, UpdateKind,
};

const TREE_URI: &str = "file:scenario.tsk";
const TREE_ID: u32 = 21;
const STABLE_TS: u64 = 100;

fn opts() -> RollbackOptions {
    RollbackOptions {
        no_checkpoint: false,
        evict_quiesce_timeout: Duration::from_millis(5),
    }
}

fn upd(value: &[u8], ts: u64, txn: u64) -> Box<Update> {
    let mut u = Update::alloc(value.to_vec(), UpdateKind::Standard);
    u.txn_id = TxnId::new(txn);
    u.start_ts = Timestamp::new(ts);
    u.durable_ts = Timestamp::new(ts);
    u
}

fn chain(updates: Vec<Box<Update>>) -> Option<Box<Update>> {
    let mut head = None;
    for u in updates.into_iter().rev() {
        tusk_types::update::prepend_chain(&mut head, u);
    }
    head
}

fn start_tw(ts: u64, txn: u64) -> TimeWindow {
    TimeWindow::with_start(Timestamp::new(ts), Timestamp::new(ts), TxnId::new(txn))
}

fn row(key: &[u8], ondisk: Option<DiskCell>, upd: Option<Box<Update>>) -> RowSlot {
    RowSlot {
        key: key.to_vec(),
        ondisk,
        upd,
        insert: Default::default(),
    }
}

fn seed_hs(engine: &Engine, key: &[u8], versions: &[(u64, &[u8])]) {
    let mut hs = engine.hs.lock();
    for &(ts, value) in versions {
        hs.insert(
            HsKey {
                btree_id: TREE_ID,
                key: key.to_vec(),
                start_ts: Timestamp::new(ts),
                counter: 0,
            },
            HsEntry {
                value: HsValue::Standard(value.to_vec()),
                tw: start_tw(ts, 1),
            },
        );
    }
}

/// Engine with one row-leaf tree whose checkpoint metadata reports the given
/// maximum durable timestamp (and optionally prepared updates on disk).
fn engine_with_rows(rows: Vec<RowSlot>, max_durable: u64, prepared: bool) -> Engine {
    let mut engine = Engine::new(ConnFlags::empty());
    engine.set_stable_timestamp(Timestamp::new(STABLE_TS));
    engine.catalog.insert(
        TREE_URI,
        format!(
            "id={TREE_ID},checkpoint=(c1=(addr=\"018281e4\",\
             newest_start_durable_ts={max_durable},newest_stop_durable_ts=0,\
             prepare={},newest_txn=2))",
            u8::from(prepared)
        ),
    );

    let ta = TimeAggregate {
        newest_start_durable_ts: Timestamp::new(max_durable),
        prepare: prepared,
        ..TimeAggregate::default()
    };
    let leaf = Page::new(PageBody::RowLeaf(RowLeafPage {
        has_disk_image: true,
        rows,
        ..RowLeafPage::default()
    }));
    let root = Ref::in_memory(Page::new(PageBody::Internal(InternalPage {
        children: vec![Ref::on_disk(Addr { ta }, leaf)],
    })));
    engine
        .trees
        .write()
        .insert(TREE_URI.to_owned(), Btree::new(TREE_ID).with_root(root));
    engine
}

fn leaf_rows(engine: &Engine) -> Vec<RowSlot> {
    let trees = engine.trees.read();
    let tree = trees.get(TREE_URI).expect("tree");
    let root = tree.root.as_deref().expect("root");
    let Some(root_page) = &root.page else {
        panic!("root resident")
    };
    let PageBody::Internal(internal) = &root_page.body else {
        panic!("internal root")
    };
    let Some(leaf_page) = &internal.children[0].page else {
        panic!("leaf resident")
    };
    let PageBody::RowLeaf(leaf) = &leaf_page.body else {
        panic!("row leaf")
    };
    leaf.rows.clone()
}

fn run(engine: &Engine) -> RtsStats {
    rollback_to_stable(engine, &opts()).expect("rollback pass")
}

// ---------------------------------------------------------------------------
// The literal scenarios
// ---------------------------------------------------------------------------

#[test]
fn single_unstable_update_no_history() {
    let engine = engine_with_rows(
        vec![row(
            b"a",
            Some(DiskCell {
                value: b"v1".to_vec(),
                tw: start_tw(80, 1),
            }),
            chain(vec![upd(b"v2", 150, 1)]),
        )],
        150,
        false,
    );

    let stats = run(&engine);

    let rows = leaf_rows(&engine);
    let head = rows[0].upd.as_deref().expect("chain");
    assert!(head.is_aborted());
    // No live update: a reader falls through to the stable on-disk v1.
    assert!(head.first_live().is_none());
    assert_eq!(stats.upd_aborted, 1);
    assert_eq!(stats.keys_removed, 0);
}

#[test]
fn unstable_update_over_stable_update() {
    let engine = engine_with_rows(
        vec![row(
            b"b",
            Some(DiskCell {
                value: b"v1".to_vec(),
                tw: start_tw(50, 1),
            }),
            chain(vec![upd(b"v3", 150, 1), upd(b"v2", 90, 1)]),
        )],
        150,
        false,
    );

    run(&engine);

    let rows = leaf_rows(&engine);
    let live = rows[0]
        .upd
        .as_deref()
        .and_then(Update::first_live)
        .expect("stable survivor");
    assert_eq!(live.value, b"v2");
    assert_eq!(live.start_ts, Timestamp::new(90));
}

#[test]
fn unstable_ondisk_restored_from_history() {
    let engine = engine_with_rows(
        vec![row(
            b"c",
            Some(DiskCell {
                value: b"v3".to_vec(),
                tw: start_tw(150, 2),
            }),
            None,
        )],
        150,
        false,
    );
    seed_hs(&engine, b"c", &[(95, b"v2"), (50, b"v1")]);

    let stats = run(&engine);

    let rows = leaf_rows(&engine);
    let live = rows[0]
        .upd
        .as_deref()
        .and_then(Update::first_live)
        .expect("restored update");
    assert_eq!(live.value, b"v2");
    assert_eq!(live.start_ts, Timestamp::new(95));
    assert!(live.flags.contains(UpdateFlags::RESTORED_FROM_HS));

    // Only the older version remains in the history store.
    let hs = engine.hs.lock();
    assert_eq!(hs.key_entry_count(TREE_ID, b"c"), 1);
    assert!(hs
        .get(&HsKey {
            btree_id: TREE_ID,
            key: b"c".to_vec(),
            start_ts: Timestamp::new(50),
            counter: 0,
        })
        .is_some());
    drop(hs);
    assert_eq!(stats.hs_restore_updates, 1);
}

#[test]
fn unstable_ondisk_no_stable_history_removes_key() {
    let engine = engine_with_rows(
        vec![row(
            b"d",
            Some(DiskCell {
                value: b"v9".to_vec(),
                tw: start_tw(150, 2),
            }),
            None,
        )],
        150,
        false,
    );
    seed_hs(&engine, b"d", &[(110, b"x"), (120, b"y")]);

    let stats = run(&engine);

    let rows = leaf_rows(&engine);
    let live = rows[0]
        .upd
        .as_deref()
        .and_then(Update::first_live)
        .expect("tombstone");
    assert_eq!(live.kind, UpdateKind::Tombstone);
    assert_eq!(engine.hs.lock().key_entry_count(TREE_ID, b"d"), 0);
    assert_eq!(stats.keys_removed, 1);
}

#[test]
fn prepared_self_delete_synthesizes_tombstone() {
    let mut tw = start_tw(120, 2);
    tw.stop_ts = Timestamp::new(120);
    tw.durable_stop_ts = Timestamp::new(120);
    tw.stop_txn = TxnId::new(2);
    tw.prepare = true;

    let engine = engine_with_rows(
        vec![row(
            b"e",
            Some(DiskCell {
                value: b"v".to_vec(),
                tw,
            }),
            None,
        )],
        120,
        true,
    );

    let stats = run(&engine);

    let rows = leaf_rows(&engine);
    let live = rows[0]
        .upd
        .as_deref()
        .and_then(Update::first_live)
        .expect("tombstone");
    assert_eq!(live.kind, UpdateKind::Tombstone);
    assert_eq!(stats.keys_removed, 1);
}

#[test]
fn fast_truncate_rolled_back() {
    let mut engine = Engine::new(ConnFlags::empty());
    engine.set_stable_timestamp(Timestamp::new(STABLE_TS));
    engine.catalog.insert(
        TREE_URI,
        format!(
            "id={TREE_ID},checkpoint=(c1=(addr=\"aa\",\
             newest_start_durable_ts=130,newest_stop_durable_ts=130,prepare=0,newest_txn=2))"
        ),
    );

    // The leaf data itself is stable; only the truncation is too new.
    let child = Ref::deleted(
        Addr {
            ta: TimeAggregate {
                newest_start_durable_ts: Timestamp::new(50),
                ..TimeAggregate::default()
            },
        },
        PageDelete {
            txn_id: TxnId::new(4),
            timestamp: Timestamp::new(130),
            durable_timestamp: Timestamp::new(130),
            committed: true,
            previous_state: RefState::Disk,
        },
    );
    let root = Ref::in_memory(Page::new(PageBody::Internal(InternalPage {
        children: vec![child],
    })));
    engine
        .trees
        .write()
        .insert(TREE_URI.to_owned(), Btree::new(TREE_ID).with_root(root));

    let stats = run(&engine);
    assert_eq!(stats.fast_truncate_rolled_back, 1);

    let trees = engine.trees.read();
    let tree = trees.get(TREE_URI).expect("tree");
    let root = tree.root.as_deref().expect("root");
    let Some(page) = &root.page else {
        panic!("root resident")
    };
    let PageBody::Internal(internal) = &page.body else {
        panic!("internal root")
    };
    // The child ref is visible again; no leaf was touched.
    assert_eq!(internal.children[0].state, RefState::Disk);
    assert!(internal.children[0].page_del.is_none());
}

#[test]
fn non_timestamped_object_truncates_history_range() {
    let mut engine = Engine::new(ConnFlags::empty());
    engine.set_stable_timestamp(Timestamp::new(STABLE_TS));
    engine.catalog.insert(
        TREE_URI,
        format!(
            "id={TREE_ID},checkpoint=(c1=(addr=\"aa\",\
             newest_start_durable_ts=0,newest_stop_durable_ts=0,prepare=0,newest_txn=2))"
        ),
    );
    engine
        .trees
        .write()
        .insert(TREE_URI.to_owned(), Btree::new(TREE_ID));
    seed_hs(&engine, b"x", &[(10, b"a"), (20, b"b")]);

    let stats = run(&engine);

    assert_eq!(stats.trees_rolled_back, 0);
    assert_eq!(stats.hs_btree_truncated, 1);
    assert_eq!(engine.hs.lock().btree_entry_count(TREE_ID), 0);
}

// ---------------------------------------------------------------------------
// Cross-cutting checks
// ---------------------------------------------------------------------------

#[test]
fn stable_update_with_hs_counterpart_trims_history() {
    let mut stable = upd(b"v2", 90, 1);
    stable.flags.insert(UpdateFlags::HS);
    let engine = engine_with_rows(
        vec![row(
            b"b2",
            Some(DiskCell {
                value: b"v1".to_vec(),
                tw: start_tw(50, 1),
            }),
            chain(vec![upd(b"v3", 150, 1), stable]),
        )],
        150,
        false,
    );
    seed_hs(&engine, b"b2", &[(90, b"v2"), (95, b"mid")]);

    run(&engine);

    // No history entry at or above the stable anchor's start remains.
    assert_eq!(engine.hs.lock().key_entry_count(TREE_ID, b"b2"), 0);
    let rows = leaf_rows(&engine);
    let live = rows[0]
        .upd
        .as_deref()
        .and_then(Update::first_live)
        .expect("stable survivor");
    assert!(!live.flags.contains(UpdateFlags::HS));
}

#[test]
fn recovery_restores_with_scrubbed_txn_ids() {
    // Transaction ids 50..99 would be re-run by recovery; the on-disk value
    // carries one of them and must be replaced even though its timestamps
    // look stable.
    let mut engine = Engine::new(ConnFlags::RECOVERING);
    engine.set_stable_timestamp(Timestamp::new(STABLE_TS));
    engine.recovery_snapshot = CheckpointSnapshot {
        snap_min: TxnId::new(50),
        snap_max: TxnId::new(100),
        snapshot: vec![TxnId::new(60)],
    };
    engine.catalog.insert(
        TREE_URI,
        format!(
            "id={TREE_ID},checkpoint=(c1=(addr=\"aa\",\
             newest_start_durable_ts=80,newest_stop_durable_ts=0,prepare=0,newest_txn=60))"
        ),
    );
    engine.catalog.insert(
        HS_URI,
        "id=0,checkpoint=(c1=(addr=\"aa\",newest_stop_durable_ts=0,newest_stop_ts=0))",
    );
    let mut hs_tree = Btree::new(0);
    hs_tree.is_hs = true;
    engine.trees.write().insert(HS_URI.to_owned(), hs_tree);

    let ta = TimeAggregate {
        newest_start_durable_ts: Timestamp::new(80),
        newest_txn: TxnId::new(60),
        ..TimeAggregate::default()
    };
    let leaf = Page::new(PageBody::RowLeaf(RowLeafPage {
        has_disk_image: true,
        rows: vec![row(
            b"r",
            Some(DiskCell {
                value: b"uncommitted".to_vec(),
                tw: start_tw(80, 60),
            }),
            None,
        )],
        ..RowLeafPage::default()
    }));
    let root = Ref::in_memory(Page::new(PageBody::Internal(InternalPage {
        children: vec![Ref::on_disk(Addr { ta }, leaf)],
    })));
    engine
        .trees
        .write()
        .insert(TREE_URI.to_owned(), Btree::new(TREE_ID).with_root(root));
    seed_hs(&engine, b"r", &[(40, b"committed")]);

    let stats = run(&engine);

    let rows = leaf_rows(&engine);
    let live = rows[0]
        .upd
        .as_deref()
        .and_then(Update::first_live)
        .expect("restored update");
    assert_eq!(live.value, b"committed");
    assert_eq!(live.txn_id, TxnId::NONE);
    assert_eq!(stats.inconsistent_ckpt, 1);
}

#[test]
fn durable_timestamp_and_checkpoint_after_pass() {
    let engine = engine_with_rows(Vec::new(), 150, false);
    engine
        .txn_global
        .durable_timestamp
        .store(170, Ordering::Release);

    run(&engine);

    assert_eq!(
        engine.txn_global.durable_timestamp.load(Ordering::Acquire),
        STABLE_TS
    );
    assert_eq!(engine.checkpoints_forced(), 1);
}

#[test]
fn rerunning_the_pass_is_idempotent() {
    let engine = engine_with_rows(
        vec![row(
            b"c",
            Some(DiskCell {
                value: b"v3".to_vec(),
                tw: start_tw(150, 2),
            }),
            None,
        )],
        150,
        false,
    );
    seed_hs(&engine, b"c", &[(95, b"v2"), (50, b"v1")]);

    run(&engine);
    let rows_first = leaf_rows(&engine);
    let hs_first = engine.hs.lock().len();

    run(&engine);
    let rows_second = leaf_rows(&engine);

    assert_eq!(engine.hs.lock().len(), hs_first);
    assert_eq!(
        rows_first[0]
            .upd
            .as_deref()
            .and_then(Update::first_live)
            .map(|u| u.value.clone()),
        rows_second[0]
            .upd
            .as_deref()
            .and_then(Update::first_live)
            .map(|u| u.value.clone())
    );
    assert_eq!(
        rows_first[0].upd.as_deref().map(Update::chain_len),
        rows_second[0].upd.as_deref().map(Update::chain_len)
    );
}
