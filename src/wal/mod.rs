//! WAL storage engine: MVCC snapshots, transactions, batched append,
//! background compaction.

pub mod engine;
pub mod lock;
pub mod record;
pub mod snapshot;

pub use engine::WalEngine;
pub use lock::FileLock;
pub use record::{RecordKind, WalRecord};
pub use snapshot::{TxOp, apply_ops};
