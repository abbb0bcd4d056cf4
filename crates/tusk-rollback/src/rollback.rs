//! The top-level rollback-to-stable pass.
//!
//! Quiesce eviction, check for active transactions, read the stable
//! timestamp once, roll back every catalog object, lower the global durable
//! timestamp, and force a checkpoint so the on-disk state matches memory.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use tracing::{debug, info, warn};

use tusk_error::{Result, TuskError};

use crate::apply;
use crate::context::{RollbackOptions, RtsContext};
use crate::engine::{ConnFlags, Engine, EvictFlags, SessionFlags};
use crate::stats::RtsStats;

/// Roll back the whole engine to the stable timestamp.
///
/// # Errors
///
/// Fails with [`TuskError::ActiveTransactions`] if user transactions are
/// running, with [`TuskError::Busy`] if an object's handle is held
/// exclusively elsewhere, and propagates any other per-object failure that
/// is not a missing or (tolerated) corrupted object. The engine remains
/// operational on failure: per-page rollback work is idempotent.
pub fn rollback_to_stable(engine: &Engine, opts: &RollbackOptions) -> Result<RtsStats> {
    // Work on a dedicated internal context rather than a user session: this
    // pass trawls every data handle and must not generate log records.
    let mut cx = RtsContext::new(engine);

    let _checkpoint_lock = engine.checkpoint_lock.lock();
    let _schema_lock = engine.schema_lock.lock();

    let result = rollback_to_stable_locked(&mut cx, opts);
    result.map(|()| cx.stats)
}

/// Perform rollback to stable on a single object.
///
/// Reads the stable timestamp and applies the object driver to `uri`;
/// non-file objects are ignored.
pub fn rollback_to_stable_one(engine: &Engine, uri: &str) -> Result<RtsStats> {
    let mut cx = RtsContext::new(engine);

    if !uri.starts_with("file:") {
        return Ok(cx.stats);
    }
    let config = engine
        .catalog
        .get(uri)
        .ok_or_else(|| TuskError::not_found(uri))?
        .to_owned();

    cx.stable_timestamp = engine.txn_global.stable_timestamp();

    cx.session_flags.insert(SessionFlags::QUIET_CORRUPT_FILE);
    let result = apply::rollback_to_stable_btree_apply(&mut cx, uri, &config);
    cx.session_flags.remove(SessionFlags::QUIET_CORRUPT_FILE);

    result.map(|()| cx.stats)
}

fn rollback_to_stable_locked(cx: &mut RtsContext<'_>, opts: &RollbackOptions) -> Result<()> {
    let mut pass_guard = quiesce_evictions(cx, opts);
    cx.session_flags.insert(SessionFlags::ROLLBACK_TO_STABLE);

    let result = rollback_pass(cx, opts, &mut pass_guard);

    // Release everything on both success and failure paths.
    drop(pass_guard.take());
    cx.session_flags
        .remove(SessionFlags::ROLLBACK_TO_STABLE | SessionFlags::LOCKED_PASS);
    result
}

/// Wait for eviction to quiesce before the active-transaction check.
///
/// Eviction can write to the history store, so the kinds that do must be
/// idle before the check; otherwise the check itself races. The wait polls
/// at millisecond intervals; when the flags clear, the eviction pass lock is
/// taken and the flags re-checked so they cannot be set again behind the
/// check. Past the configured bound, proceed anyway and leave a warning.
fn quiesce_evictions<'e>(
    cx: &mut RtsContext<'e>,
    opts: &RollbackOptions,
) -> Option<MutexGuard<'e, ()>> {
    let engine = cx.engine;

    // Shutdown and in-memory configurations cannot race history store
    // eviction.
    if engine
        .conn_flags
        .intersects(ConnFlags::CLOSING_TIMESTAMP | ConnFlags::IN_MEMORY)
    {
        return None;
    }

    let deadline = Instant::now() + opts.evict_quiesce_timeout;
    loop {
        if !engine.cache.evict_flags().intersects(EvictFlags::HS_FLAGS) {
            // Interrupt the eviction server and take its pass lock so the
            // flags cannot be set after this point.
            engine.cache.pass_intr.fetch_add(1, Ordering::AcqRel);
            let guard = engine.cache.evict_pass_lock.lock();
            engine.cache.pass_intr.fetch_sub(1, Ordering::AcqRel);

            if !engine.cache.evict_flags().intersects(EvictFlags::HS_FLAGS) {
                cx.session_flags.insert(SessionFlags::LOCKED_PASS);
                return Some(guard);
            }
            drop(guard);
        }

        if Instant::now() >= deadline {
            warn!("timed out waiting for eviction to quiesce, running rollback to stable");
            return None;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn rollback_pass<'e>(
    cx: &mut RtsContext<'e>,
    opts: &RollbackOptions,
    pass_guard: &mut Option<MutexGuard<'e, ()>>,
) -> Result<()> {
    let engine = cx.engine;

    // Help the caller comply with the requirement that there are no
    // concurrent operations.
    if engine.txn_global.active_transactions.load(Ordering::Acquire) > 0 {
        return Err(TuskError::ActiveTransactions);
    }

    // The pre-check is done; the eviction server can run again.
    if pass_guard.take().is_some() {
        cx.session_flags.remove(SessionFlags::LOCKED_PASS);
    }

    // Copy the stable timestamp once: it is not supposed to move while the
    // pass runs, but unlocked reads of a moving value would still violate
    // protocol.
    cx.stable_timestamp = engine.txn_global.stable_timestamp();
    info!(
        stable_ts = %cx.stable_timestamp,
        oldest_ts = %engine.txn_global.oldest_timestamp(),
        "performing rollback to stable"
    );
    if engine.recovering() {
        debug!(
            snap_min = %engine.recovery_snapshot.snap_min,
            snap_max = %engine.recovery_snapshot.snap_max,
            snap_count = engine.recovery_snapshot.snapshot.len(),
            "recovered checkpoint snapshot"
        );
    }

    apply::apply_all(cx)?;

    // Lower the global durable timestamp to the stable timestamp: nothing
    // newer survived.
    engine.txn_global.durable_timestamp.store(
        engine.txn_global.stable_timestamp.load(Ordering::Acquire),
        Ordering::Release,
    );
    engine.txn_global.has_durable_timestamp.store(
        engine
            .txn_global
            .has_stable_timestamp
            .load(Ordering::Acquire),
        Ordering::Release,
    );

    if !engine.in_memory() && !opts.no_checkpoint {
        engine.force_checkpoint();
    }
    Ok(())
}
