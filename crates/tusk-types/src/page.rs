//! Pages, refs, and the in-memory tree structure.
//!
//! Pages are a tagged variant over the four layouts: row leaf, variable-width
//! column leaf, fixed-width column leaf, and internal. A [`Ref`] points at a
//! page and carries its lifecycle state; a ref in [`RefState::Deleted`] state
//! may hold a fast-truncate descriptor with its own durable timestamp.
//!
//! Cells arrive pre-unpacked: an on-disk key position holds a [`DiskCell`]
//! (value plus time window) rather than raw cell bytes.

use bitflags::bitflags;

use crate::time::{TimeAggregate, TimeWindow, Timestamp, TxnId};
use crate::update::Update;

bitflags! {
    /// Flags controlling how the tree walker reads pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ReadFlags: u8 {
        /// Do not evict pages read under this flag.
        const NO_EVICT = 0b0000_0001;
        /// The page will not be needed again; mark it for quick discard.
        const WONT_NEED = 0b0000_0010;
    }
}

// ---------------------------------------------------------------------------
// Cells
// ---------------------------------------------------------------------------

/// An unpacked on-disk value cell for a row-leaf key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskCell {
    pub value: Vec<u8>,
    pub tw: TimeWindow,
}

/// Cell kind on a variable-width column page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Value,
    /// A deleted run; carries no value to roll back.
    Deleted,
}

/// An unpacked on-disk cell on a variable-width column page, covering
/// `rle` consecutive records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarCell {
    pub kind: CellKind,
    pub value: Vec<u8>,
    pub tw: TimeWindow,
    pub rle: u64,
}

// ---------------------------------------------------------------------------
// Insert lists
// ---------------------------------------------------------------------------

/// One inserted key with its update chain.
#[derive(Debug, Clone, Default)]
pub struct InsertEntry<K> {
    pub key: K,
    pub upd: Option<Box<Update>>,
}

/// An ordered list of inserted keys (row keys or record numbers) that are
/// not present on the disk image.
#[derive(Debug, Clone)]
pub struct InsertList<K> {
    pub entries: Vec<InsertEntry<K>>,
}

impl<K> Default for InsertList<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: Ord> InsertList<K> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry for `key`, created in sorted position if absent.
    pub fn entry_mut(&mut self, key: K) -> &mut InsertEntry<K> {
        let at = match self.entries.binary_search_by(|e| e.key.cmp(&key)) {
            Ok(i) => i,
            Err(i) => {
                self.entries.insert(i, InsertEntry { key, upd: None });
                i
            }
        };
        &mut self.entries[at]
    }

    /// The existing entry for `key`, if any.
    #[must_use]
    pub fn find(&self, key: &K) -> Option<&InsertEntry<K>> {
        self.entries
            .binary_search_by(|e| e.key.cmp(key))
            .ok()
            .map(|i| &self.entries[i])
    }
}

// ---------------------------------------------------------------------------
// Leaf pages
// ---------------------------------------------------------------------------

/// One on-disk key position on a row leaf page.
#[derive(Debug, Clone, Default)]
pub struct RowSlot {
    pub key: Vec<u8>,
    pub ondisk: Option<DiskCell>,
    pub upd: Option<Box<Update>>,
    /// Keys inserted after this key but before the next on-disk key.
    pub insert: InsertList<Vec<u8>>,
}

/// A row-store leaf page.
#[derive(Debug, Clone, Default)]
pub struct RowLeafPage {
    /// Keys inserted before the first on-disk key.
    pub insert_smallest: InsertList<Vec<u8>>,
    pub rows: Vec<RowSlot>,
    pub has_disk_image: bool,
}

/// One cell position on a variable-width column leaf page.
#[derive(Debug, Clone, Default)]
pub struct ColCell {
    pub ondisk: Option<VarCell>,
    /// Updates for records within this cell's range, keyed by record number.
    pub update: InsertList<u64>,
}

/// A variable-width column-store leaf page.
#[derive(Debug, Clone, Default)]
pub struct ColVarPage {
    /// Record number of the first on-disk cell.
    pub start_recno: u64,
    pub cells: Vec<ColCell>,
    /// Records appended past the end of the on-disk image.
    pub append: InsertList<u64>,
    pub has_disk_image: bool,
}

impl ColVarPage {
    /// Prepend an update chain for `recno`, landing it on the cell whose RLE
    /// range covers the record, or on the append list past the end.
    pub fn insert_update(&mut self, recno: u64, upd: Box<Update>) {
        let mut cur = if self.has_disk_image {
            self.start_recno
        } else {
            0
        };
        for cell in &mut self.cells {
            let span = cell.ondisk.as_ref().map_or(1, |c| c.rle.max(1));
            if recno < cur + span {
                let entry = cell.update.entry_mut(recno);
                crate::update::prepend_chain(&mut entry.upd, upd);
                return;
            }
            cur += span;
        }
        let entry = self.append.entry_mut(recno);
        crate::update::prepend_chain(&mut entry.upd, upd);
    }
}

/// A fixed-width column-store leaf page.
#[derive(Debug, Clone, Default)]
pub struct ColFixPage {
    pub update: InsertList<u64>,
    pub append: InsertList<u64>,
}

// ---------------------------------------------------------------------------
// Internal pages and refs
// ---------------------------------------------------------------------------

/// An internal page: an ordered set of child refs.
#[derive(Debug, Clone, Default)]
pub struct InternalPage {
    pub children: Vec<Ref>,
}

/// Lifecycle state of a ref.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefState {
    /// The page is on disk and not resident.
    Disk,
    /// The page is resident in memory.
    InMemory,
    /// The page was fast-truncated; see [`PageDelete`].
    Deleted,
}

/// Fast-truncate descriptor: a leaf child logically deleted without
/// materializing per-key tombstones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDelete {
    pub txn_id: TxnId,
    pub timestamp: Timestamp,
    pub durable_timestamp: Timestamp,
    pub committed: bool,
    /// Ref state to restore if the truncation is rolled back.
    pub previous_state: RefState,
}

/// A block address with its aggregated time window.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Addr {
    pub ta: TimeAggregate,
}

/// Reconciliation result recorded on a page's modify structure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecResult {
    /// The page was replaced by a single block.
    Replace(Addr),
    /// The page was split into multiple blocks.
    Multi(Vec<Addr>),
}

/// Page modification state.
#[derive(Debug, Clone, Default)]
pub struct PageModify {
    pub dirty: bool,
    pub rec_result: Option<RecResult>,
}

/// The four page layouts.
#[derive(Debug, Clone)]
pub enum PageBody {
    RowLeaf(RowLeafPage),
    ColVar(ColVarPage),
    ColFix(ColFixPage),
    Internal(InternalPage),
}

/// An in-memory page: modification state plus the layout-specific body.
#[derive(Debug, Clone)]
pub struct Page {
    pub modify: Option<PageModify>,
    pub body: PageBody,
}

impl Page {
    #[must_use]
    pub fn new(body: PageBody) -> Self {
        Self { modify: None, body }
    }

    #[must_use]
    pub fn is_modified(&self) -> bool {
        self.modify.as_ref().is_some_and(|m| m.dirty)
    }

    /// Mark the page dirty so a later checkpoint reconciles it.
    pub fn mark_dirty(&mut self) {
        self.modify.get_or_insert_with(PageModify::default).dirty = true;
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self.body, PageBody::Internal(_))
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self.body {
            PageBody::RowLeaf(_) => "row-leaf",
            PageBody::ColVar(_) => "col-var",
            PageBody::ColFix(_) => "col-fix",
            PageBody::Internal(_) => "internal",
        }
    }
}

/// A reference to a page within a tree.
#[derive(Debug, Clone)]
pub struct Ref {
    pub state: RefState,
    /// Off-page block address, when the page has one.
    pub addr: Option<Addr>,
    /// The page image. Present for resident pages and for disk-state refs
    /// whose backing block is available to read.
    pub page: Option<Box<Page>>,
    /// Fast-truncate descriptor for refs in `Deleted` state.
    pub page_del: Option<PageDelete>,
}

impl Ref {
    /// A resident in-memory ref.
    #[must_use]
    pub fn in_memory(page: Page) -> Self {
        Self {
            state: RefState::InMemory,
            addr: None,
            page: Some(Box::new(page)),
            page_del: None,
        }
    }

    /// An on-disk ref with a block address and a readable backing image.
    #[must_use]
    pub fn on_disk(addr: Addr, page: Page) -> Self {
        Self {
            state: RefState::Disk,
            addr: Some(addr),
            page: Some(Box::new(page)),
            page_del: None,
        }
    }

    /// A fast-truncated ref.
    #[must_use]
    pub fn deleted(addr: Addr, del: PageDelete) -> Self {
        Self {
            state: RefState::Deleted,
            addr: Some(addr),
            page: None,
            page_del: Some(del),
        }
    }
}
