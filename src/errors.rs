//! Crate-wide error taxonomy.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Codec(String),

    #[error("serde JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("unsupported format version: found {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("structural corruption at offset {offset}: {reason}")]
    StructuralCorruption { offset: u64, reason: String },

    #[error("lock contention acquiring {path:?}")]
    LockContention { path: PathBuf },

    #[error("transaction {txid} already terminated")]
    Terminated { txid: u64 },

    #[error("unknown transaction id {txid}")]
    UnknownTxid { txid: u64 },

    #[error("unique constraint violated on field {field:?} for value {value:?}")]
    UniqueConstraint { field: String, value: String },

    #[error("compaction failed: {0}")]
    CompactionFailed(String),

    #[error("no such collection: {0}")]
    NoSuchCollection(String),

    #[error("operation not supported by this storage backend: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}
