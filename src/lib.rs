//! Embedded document database persistence core.
//!
//! Layered bottom-up: packed doc-id [`bitmap`] postings, a disk-resident
//! [`btree`] index, a [`fileengine`] that pairs that tree with an
//! append-growing document region, a [`wal`] MVCC engine for transactional
//! tables, an in-memory [`memindex`] for secondary lookups, an [`catalog`] of
//! index definitions, and a [`storage`] contract unifying both engines for a
//! table layer to drive.

#![forbid(unsafe_code)]

pub mod bitmap;
pub mod btree;
pub mod catalog;
pub mod config;
pub mod errors;
pub mod fileengine;
pub mod fsutil;
pub mod logger;
pub mod memindex;
pub mod schema;
pub mod storage;
pub mod wal;

pub use bitmap::Bitmap;
pub use catalog::{Catalog, IndexDefinition};
pub use config::Config;
pub use errors::{Error, Result};
pub use fileengine::FileEngine;
pub use memindex::MemIndex;
pub use schema::SchemaSpec;
pub use storage::{DocumentStore, StorageContract, TransactionalStore};
pub use wal::WalEngine;

/// Initializes the crate's logger.
///
/// # Errors
/// Returns an error if the logger cannot be initialized.
pub fn init() -> Result<()> {
    logger::init().map_err(|e| Error::InvalidFormat(e.to_string()))
}
