//! Shared data model for the tuskdb storage engine.
//!
//! Timestamps and transaction ids, time windows and aggregates, in-memory
//! update chains, page and tree structures, the history store, and the
//! recovered-checkpoint snapshot. The rollback subsystem operates entirely
//! on the types defined here.

pub mod hs;
pub mod modify;
pub mod page;
pub mod snapshot;
pub mod time;
pub mod update;

pub use hs::{recno_key, HistoryStore, HsEntry, HsKey, HsValue};
pub use modify::{apply_modify, ModifyOp};
pub use page::{
    Addr, CellKind, ColCell, ColFixPage, ColVarPage, DiskCell, InsertEntry, InsertList,
    InternalPage, Page, PageBody, PageDelete, PageModify, ReadFlags, RecResult, Ref, RefState,
    RowLeafPage, RowSlot, VarCell,
};
pub use snapshot::CheckpointSnapshot;
pub use time::{TimeAggregate, TimeWindow, Timestamp, TxnId};
pub use update::{PrepareState, Update, UpdateFlags, UpdateKind};
