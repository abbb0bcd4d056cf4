//! The per-pass context threaded through every rollback routine.

use std::time::Duration;

use tusk_types::Timestamp;

use crate::engine::{Engine, SessionFlags};
use crate::stats::RtsStats;

/// Caller-facing knobs for a rollback pass.
#[derive(Debug, Clone)]
pub struct RollbackOptions {
    /// Skip the forced checkpoint at the end of the pass.
    pub no_checkpoint: bool,
    /// How long to wait for eviction to quiesce before proceeding anyway.
    pub evict_quiesce_timeout: Duration,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            no_checkpoint: false,
            evict_quiesce_timeout: Duration::from_secs(120),
        }
    }
}

/// Identity of the tree currently being processed.
#[derive(Debug, Clone, Copy)]
pub struct TreeRef {
    pub id: u32,
    pub is_hs: bool,
}

/// The internal session a rollback pass runs on: the engine handle, the
/// stable timestamp copied once at the start, session flags, and the
/// statistics being accumulated.
pub struct RtsContext<'e> {
    pub engine: &'e Engine,
    pub stable_timestamp: Timestamp,
    pub session_flags: SessionFlags,
    pub stats: RtsStats,
}

impl<'e> RtsContext<'e> {
    #[must_use]
    pub fn new(engine: &'e Engine) -> Self {
        Self {
            engine,
            stable_timestamp: Timestamp::NONE,
            session_flags: SessionFlags::NO_LOGGING,
            stats: RtsStats::default(),
        }
    }

    #[must_use]
    pub fn recovering(&self) -> bool {
        self.engine.recovering()
    }
}
