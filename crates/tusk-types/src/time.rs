//! Timestamps, transaction ids, time windows, and time aggregates.

use std::fmt;

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// A 64-bit commit or durable timestamp. Zero denotes "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The "no timestamp" sentinel.
    pub const NONE: Self = Self(0);
    /// The maximum timestamp, used as the "no stop" sentinel.
    pub const MAX: Self = Self(u64::MAX);

    #[must_use]
    pub const fn new(ts: u64) -> Self {
        Self(ts)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == u64::MAX {
            write!(f, "max")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// TxnId
// ---------------------------------------------------------------------------

/// A 64-bit transaction id.
///
/// `NONE` marks entries whose id has been scrubbed (typical after recovery),
/// `ABORTED` marks discarded updates, and `MAX` is the "no stop transaction"
/// sentinel on time windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxnId(u64);

impl TxnId {
    /// No transaction id.
    pub const NONE: Self = Self(0);
    /// Sentinel for the largest assignable transaction id.
    pub const MAX: Self = Self(u64::MAX - 10);
    /// Sentinel marking a discarded update.
    pub const ABORTED: Self = Self(u64::MAX);

    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TimeWindow
// ---------------------------------------------------------------------------

/// The start/stop validity window bound to an on-disk cell or a history
/// store entry.
///
/// A window has a *stop* side iff the value was deleted by a later update;
/// otherwise the stop fields keep their "no stop" sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start_ts: Timestamp,
    pub durable_start_ts: Timestamp,
    pub start_txn: TxnId,
    pub stop_ts: Timestamp,
    pub durable_stop_ts: Timestamp,
    pub stop_txn: TxnId,
    /// Whether the window was written by a prepared, uncommitted transaction.
    pub prepare: bool,
}

impl TimeWindow {
    /// Whether this window carries a stop side (the value was deleted).
    #[must_use]
    pub const fn has_stop(&self) -> bool {
        self.stop_ts.get() != u64::MAX
    }

    /// Build a start-only window.
    #[must_use]
    pub fn with_start(start_ts: Timestamp, durable_start_ts: Timestamp, start_txn: TxnId) -> Self {
        Self {
            start_ts,
            durable_start_ts,
            start_txn,
            ..Self::default()
        }
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start_ts: Timestamp::NONE,
            durable_start_ts: Timestamp::NONE,
            start_txn: TxnId::NONE,
            stop_ts: Timestamp::MAX,
            durable_stop_ts: Timestamp::NONE,
            stop_txn: TxnId::MAX,
            prepare: false,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeAggregate
// ---------------------------------------------------------------------------

/// Summary time window over a page or block address: the newest start/stop
/// durable timestamps, the newest stop commit timestamp, the newest
/// transaction id, and whether any contained update was prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeAggregate {
    pub newest_start_durable_ts: Timestamp,
    pub newest_stop_durable_ts: Timestamp,
    pub newest_stop_ts: Timestamp,
    pub newest_txn: TxnId,
    pub prepare: bool,
}
