//! The engine substrate rollback runs against: connection flags, transaction
//! globals, cache eviction state, the metadata catalog, and the tree map.
//!
//! This is the collaborator surface of the subsystem, kept to the minimum the
//! rollback pass exercises.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use tusk_types::{CheckpointSnapshot, HistoryStore, Ref, Timestamp};

/// Well-known uri of the history store object.
pub const HS_URI: &str = "file:tusk_hs.tsk";

/// Well-known uri of the metadata object.
pub const METAFILE_URI: &str = "file:tusk_meta.tsk";

bitflags! {
    /// Connection-wide state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnFlags: u8 {
        /// Crash recovery is running; rollback consults the recovered
        /// checkpoint snapshot.
        const RECOVERING = 0b0000_0001;
        /// No on-disk storage and no history store.
        const IN_MEMORY = 0b0000_0010;
        /// The engine is shutting down at a timestamp.
        const CLOSING_TIMESTAMP = 0b0000_0100;
        /// Tolerate object-level corruption: log and keep going.
        const DATA_CORRUPTION = 0b0000_1000;
    }
}

bitflags! {
    /// Per-session state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SessionFlags: u8 {
        /// Suppress corruption errors while scanning the catalog.
        const QUIET_CORRUPT_FILE = 0b0000_0001;
        /// A rollback pass is running on this session.
        const ROLLBACK_TO_STABLE = 0b0000_0010;
        /// The eviction pass lock is held by this session.
        const LOCKED_PASS = 0b0000_0100;
        /// Log records are suppressed on this session.
        const NO_LOGGING = 0b0000_1000;
    }
}

bitflags! {
    /// Cache eviction activity flags. The set that can lead to history store
    /// writes must be clear before rollback starts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EvictFlags: u32 {
        const DIRTY = 0b0000_0001;
        const UPDATES = 0b0000_0010;
        const URGENT = 0b0000_0100;
    }
}

impl EvictFlags {
    /// Eviction kinds that can result in a history store operation.
    pub const HS_FLAGS: Self = Self::DIRTY.union(Self::UPDATES).union(Self::URGENT);
}

// ---------------------------------------------------------------------------
// Transaction globals and cache
// ---------------------------------------------------------------------------

/// Engine-wide transaction state.
#[derive(Debug, Default)]
pub struct TxnGlobal {
    pub stable_timestamp: AtomicU64,
    pub durable_timestamp: AtomicU64,
    pub oldest_timestamp: AtomicU64,
    pub has_stable_timestamp: AtomicBool,
    pub has_durable_timestamp: AtomicBool,
    /// Number of running user transactions.
    pub active_transactions: AtomicU32,
}

impl TxnGlobal {
    /// Atomically read the stable timestamp.
    #[must_use]
    pub fn stable_timestamp(&self) -> Timestamp {
        Timestamp::new(self.stable_timestamp.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn oldest_timestamp(&self) -> Timestamp {
        Timestamp::new(self.oldest_timestamp.load(Ordering::Acquire))
    }
}

/// Cache eviction state: the activity flags word, the eviction server's pass
/// lock, and the interrupt counter that parks the server while the lock is
/// being taken.
#[derive(Debug, Default)]
pub struct Cache {
    pub flags: AtomicU32,
    pub evict_pass_lock: Mutex<()>,
    pub pass_intr: AtomicU32,
}

impl Cache {
    /// Read the eviction flags with acquire semantics.
    #[must_use]
    pub fn evict_flags(&self) -> EvictFlags {
        EvictFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_evict_flags(&self, flags: EvictFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Catalog and trees
// ---------------------------------------------------------------------------

/// The metadata catalog: `(uri, config)` pairs in uri order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<String, String>,
}

impl Catalog {
    pub fn insert(&mut self, uri: impl Into<String>, config: impl Into<String>) {
        self.entries.insert(uri.into(), config.into());
    }

    #[must_use]
    pub fn get(&self, uri: &str) -> Option<&str> {
        self.entries.get(uri).map(String::as_str)
    }

    /// Snapshot of all entries, in uri order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// One object: a B-tree with its handle state.
#[derive(Debug, Clone)]
pub struct Btree {
    pub id: u32,
    pub root: Option<Box<Ref>>,
    /// Whether the tree has uncheckpointed modifications.
    pub modified: bool,
    /// Whether a data handle for the tree is cached.
    pub open: bool,
    /// Whether the handle is held exclusively elsewhere; opening fails busy.
    pub exclusive_busy: bool,
    /// Updates are logged synchronously; rollback never rewrites the tree.
    pub immediately_durable: bool,
    /// This tree is the history store.
    pub is_hs: bool,
    /// Name of the checkpoint this handle reads, for checkpoint handles.
    pub checkpoint: Option<String>,
}

impl Btree {
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self {
            id,
            root: None,
            modified: false,
            open: false,
            exclusive_busy: false,
            immediately_durable: false,
            is_hs: false,
            checkpoint: None,
        }
    }

    #[must_use]
    pub fn with_root(mut self, root: Ref) -> Self {
        self.root = Some(Box::new(root));
        self
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The engine: everything rollback touches, wired together.
#[derive(Debug)]
pub struct Engine {
    pub conn_flags: ConnFlags,
    pub recovery_snapshot: CheckpointSnapshot,
    pub txn_global: TxnGlobal,
    pub cache: Cache,
    pub catalog: Catalog,
    /// Tree map, guarded by the handle-list lock.
    pub trees: RwLock<BTreeMap<String, Btree>>,
    pub hs: Mutex<HistoryStore>,
    pub checkpoint_lock: Mutex<()>,
    pub schema_lock: Mutex<()>,
    checkpoints_forced: AtomicU64,
}

impl Engine {
    #[must_use]
    pub fn new(conn_flags: ConnFlags) -> Self {
        Self {
            conn_flags,
            recovery_snapshot: CheckpointSnapshot::default(),
            txn_global: TxnGlobal::default(),
            cache: Cache::default(),
            catalog: Catalog::default(),
            trees: RwLock::new(BTreeMap::new()),
            hs: Mutex::new(HistoryStore::new()),
            checkpoint_lock: Mutex::new(()),
            schema_lock: Mutex::new(()),
            checkpoints_forced: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn recovering(&self) -> bool {
        self.conn_flags.contains(ConnFlags::RECOVERING)
    }

    #[must_use]
    pub fn in_memory(&self) -> bool {
        self.conn_flags.contains(ConnFlags::IN_MEMORY)
    }

    /// Set the stable timestamp, as the application would between commits.
    pub fn set_stable_timestamp(&self, ts: Timestamp) {
        self.txn_global
            .stable_timestamp
            .store(ts.get(), Ordering::Release);
        self.txn_global
            .has_stable_timestamp
            .store(!ts.is_none(), Ordering::Release);
    }

    /// Force a checkpoint so the on-disk state matches memory.
    pub fn force_checkpoint(&self) {
        self.checkpoints_forced.fetch_add(1, Ordering::AcqRel);
        tracing::info!("forced checkpoint");
    }

    /// Number of forced checkpoints taken so far.
    #[must_use]
    pub fn checkpoints_forced(&self) -> u64 {
        self.checkpoints_forced.load(Ordering::Acquire)
    }
}
