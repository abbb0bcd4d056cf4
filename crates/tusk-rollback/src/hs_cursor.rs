//! History store cursor wrapper.
//!
//! Rollback operates exclusively, outside the constraints of transactions,
//! so reads are committed-read: no snapshot filtering. The wrapper pins the
//! cursor to a search scope — one `(btree id, key)` pair, or one btree — and
//! never yields an entry outside it.

use tusk_error::{Result, TuskError};
use tusk_types::{HistoryStore, HsEntry, HsKey, Timestamp};

#[derive(Debug, Clone)]
enum Scope {
    /// Descending-timestamp iteration over one key's versions.
    Key { btree_id: u32, key: Vec<u8> },
    /// Ascending iteration over everything stored for one btree.
    Btree { btree_id: u32 },
}

/// A positioned cursor over the history store.
pub struct HsCursor<'a> {
    hs: &'a mut HistoryStore,
    scope: Option<Scope>,
    pos: Option<HsKey>,
}

impl<'a> HsCursor<'a> {
    #[must_use]
    pub fn new(hs: &'a mut HistoryStore) -> Self {
        Self {
            hs,
            scope: None,
            pos: None,
        }
    }

    /// Position at the largest entry for `(btree_id, key)`, i.e. the one
    /// with the greatest `(start timestamp, counter)`. Subsequent [`prev`]
    /// calls yield older versions of the same key.
    ///
    /// [`prev`]: Self::prev
    pub fn search_before(&mut self, btree_id: u32, key: &[u8]) -> Option<(HsKey, HsEntry)> {
        self.scope = Some(Scope::Key {
            btree_id,
            key: key.to_vec(),
        });
        let upper = HsKey {
            btree_id,
            key: key.to_vec(),
            start_ts: Timestamp::MAX,
            counter: u64::MAX,
        };
        let found = self
            .hs
            .map()
            .range(..=upper)
            .next_back()
            .filter(|(k, _)| k.btree_id == btree_id && k.key == key)
            .map(|(k, e)| (k.clone(), e.clone()));
        self.pos = found.as_ref().map(|(k, _)| k.clone());
        found
    }

    /// Position at the smallest entry stored for `btree_id`. Subsequent
    /// [`next`] calls yield ascending entries within the btree.
    ///
    /// [`next`]: Self::next
    pub fn search_after(&mut self, btree_id: u32) -> Option<(HsKey, HsEntry)> {
        self.scope = Some(Scope::Btree { btree_id });
        let lower = HsKey {
            btree_id,
            key: Vec::new(),
            start_ts: Timestamp::NONE,
            counter: 0,
        };
        let found = self
            .hs
            .map()
            .range(lower..)
            .next()
            .filter(|(k, _)| k.btree_id == btree_id)
            .map(|(k, e)| (k.clone(), e.clone()));
        self.pos = found.as_ref().map(|(k, _)| k.clone());
        found
    }

    /// Step to the next older entry within the cursor's scope.
    pub fn prev(&mut self) -> Option<(HsKey, HsEntry)> {
        use std::ops::Bound;

        let pos = self.pos.clone()?;
        let candidate = self
            .hs
            .map()
            .range((Bound::Unbounded, Bound::Excluded(pos)))
            .next_back()
            .map(|(k, e)| (k.clone(), e.clone()));
        let found = candidate.filter(|(k, _)| self.in_scope(k))?;
        self.pos = Some(found.0.clone());
        Some(found)
    }

    /// Step to the next newer entry within the cursor's scope.
    pub fn next(&mut self) -> Option<(HsKey, HsEntry)> {
        use std::ops::Bound;

        let pos = self.pos.clone()?;
        let candidate = self
            .hs
            .map()
            .range((Bound::Excluded(pos), Bound::Unbounded))
            .next()
            .map(|(k, e)| (k.clone(), e.clone()));
        let found = candidate.filter(|(k, _)| self.in_scope(k))?;
        self.pos = Some(found.0.clone());
        Some(found)
    }

    /// Delete the entry at the current position. The position is preserved
    /// so a subsequent [`prev`]/[`next`] continues from the same point.
    ///
    /// [`prev`]: Self::prev
    /// [`next`]: Self::next
    pub fn remove(&mut self) -> Result<()> {
        let pos = self
            .pos
            .as_ref()
            .ok_or_else(|| TuskError::internal("history store cursor remove without position"))?;
        self.hs
            .remove(pos)
            .ok_or_else(|| TuskError::internal("positioned history store entry vanished"))?;
        Ok(())
    }

    fn in_scope(&self, k: &HsKey) -> bool {
        match &self.scope {
            Some(Scope::Key { btree_id, key }) => k.btree_id == *btree_id && k.key == *key,
            Some(Scope::Btree { btree_id }) => k.btree_id == *btree_id,
            None => false,
        }
    }
}
