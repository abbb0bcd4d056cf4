//! History store storage: older versions of keys, ordered by
//! `(btree id, key, start timestamp, counter)`.

use std::collections::BTreeMap;

use crate::modify::ModifyOp;
use crate::time::{TimeWindow, Timestamp};

/// Key of a history store entry.
///
/// Derived ordering is the on-disk ordering: btree id first, then key bytes,
/// then start timestamp, then the insertion counter that disambiguates equal
/// timestamps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HsKey {
    pub btree_id: u32,
    pub key: Vec<u8>,
    pub start_ts: Timestamp,
    pub counter: u64,
}

/// Value payload of a history store entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HsValue {
    /// A full older value.
    Standard(Vec<u8>),
    /// A delta against the next newer full value.
    Modify(Vec<ModifyOp>),
}

/// A history store entry: the payload plus the full time window of the
/// version it preserves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HsEntry {
    pub value: HsValue,
    pub tw: TimeWindow,
}

impl HsEntry {
    /// Durable timestamp of the preserved version.
    #[must_use]
    pub fn durable_ts(&self) -> Timestamp {
        self.tw.durable_start_ts
    }

    /// Durable timestamp of the deletion that superseded the version.
    #[must_use]
    pub fn stop_durable_ts(&self) -> Timestamp {
        self.tw.durable_stop_ts
    }
}

/// Encode a column-store record number as history store key bytes.
///
/// Big-endian so byte ordering matches record-number ordering.
#[must_use]
pub fn recno_key(recno: u64) -> Vec<u8> {
    recno.to_be_bytes().to_vec()
}

/// The history store: an ordered map standing in for the history store
/// B-tree's point-lookup surface.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    entries: BTreeMap<HsKey, HsEntry>,
}

impl HistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: HsKey, entry: HsEntry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &HsKey) -> Option<HsEntry> {
        self.entries.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &HsKey) -> Option<&HsEntry> {
        self.entries.get(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The underlying ordered map, for range scans.
    #[must_use]
    pub fn map(&self) -> &BTreeMap<HsKey, HsEntry> {
        &self.entries
    }

    /// Number of entries stored for one btree.
    #[must_use]
    pub fn btree_entry_count(&self, btree_id: u32) -> usize {
        self.entries.keys().filter(|k| k.btree_id == btree_id).count()
    }

    /// Number of entries stored for one `(btree id, key)` pair.
    #[must_use]
    pub fn key_entry_count(&self, btree_id: u32, key: &[u8]) -> usize {
        self.entries
            .keys()
            .filter(|k| k.btree_id == btree_id && k.key == key)
            .count()
    }
}
