//! In-memory updates and per-key update chains.
//!
//! An update chain is a singly linked LIFO owned by its page; the head is the
//! newest update. Rollback mutates chains in place (aborting entries) and
//! prepends synthesized updates restored from the data store or the history
//! store.

use bitflags::bitflags;

use crate::time::{Timestamp, TxnId};

/// The kind of an in-memory update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// A full value.
    Standard,
    /// A delta against the next older full value.
    Modify,
    /// A deletion marker.
    Tombstone,
}

/// Prepare state of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepareState {
    #[default]
    Resolved,
    /// Prepared but not yet committed; always unstable under rollback.
    InProgress,
}

bitflags! {
    /// Per-update flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateFlags: u8 {
        /// The update has a counterpart in the history store.
        const HS = 0b0000_0001;
        /// Synthesized from a history store entry during rollback.
        const RESTORED_FROM_HS = 0b0000_0010;
        /// Synthesized from the on-disk cell during rollback.
        const RESTORED_FROM_DS = 0b0000_0100;
    }
}

/// One in-memory update on a per-key chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub kind: UpdateKind,
    /// Full value for `Standard`, encoded delta for `Modify`, empty for
    /// `Tombstone`.
    pub value: Vec<u8>,
    pub txn_id: TxnId,
    pub start_ts: Timestamp,
    pub durable_ts: Timestamp,
    pub prepare_state: PrepareState,
    pub flags: UpdateFlags,
    pub next: Option<Box<Update>>,
}

impl Update {
    /// Allocate a standalone update of the given kind.
    #[must_use]
    pub fn alloc(value: Vec<u8>, kind: UpdateKind) -> Box<Self> {
        Box::new(Self {
            kind,
            value,
            txn_id: TxnId::NONE,
            start_ts: Timestamp::NONE,
            durable_ts: Timestamp::NONE,
            prepare_state: PrepareState::Resolved,
            flags: UpdateFlags::empty(),
            next: None,
        })
    }

    /// Allocate a standalone tombstone.
    #[must_use]
    pub fn alloc_tombstone() -> Box<Self> {
        Self::alloc(Vec::new(), UpdateKind::Tombstone)
    }

    /// Whether this update has been discarded.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.txn_id == TxnId::ABORTED
    }

    /// The last update of the chain rooted at `self`.
    pub fn chain_tail_mut(&mut self) -> &mut Update {
        match self.next {
            Some(ref mut next) => next.chain_tail_mut(),
            None => self,
        }
    }

    /// The newest non-aborted update in the chain rooted at `self`.
    #[must_use]
    pub fn first_live(&self) -> Option<&Update> {
        let mut cur = Some(self);
        while let Some(u) = cur {
            if !u.is_aborted() {
                return Some(u);
            }
            cur = u.next.as_deref();
        }
        None
    }

    /// Number of updates in the chain rooted at `self`, aborted included.
    #[must_use]
    pub fn chain_len(&self) -> usize {
        let mut n = 0;
        let mut cur = Some(self);
        while let Some(u) = cur {
            n += 1;
            cur = u.next.as_deref();
        }
        n
    }
}

/// Prepend an already-linked chain of new updates to a chain head.
///
/// Ownership of `new` transfers to the chain; the previous head becomes the
/// tail's successor.
pub fn prepend_chain(head: &mut Option<Box<Update>>, mut new: Box<Update>) {
    new.chain_tail_mut().next = head.take();
    *head = Some(new);
}
