//! Wire format for a single WAL record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Begin,
    Write,
    Update,
    Delete,
    Commit,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalRecord {
    #[serde(rename = "type")]
    pub kind: RecordKind,
    pub txid: u32,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable: Option<bool>,
}

impl WalRecord {
    #[must_use]
    pub fn begin(txid: u32, timestamp: u64) -> Self {
        Self { kind: RecordKind::Begin, txid, timestamp, data: None, stable: None }
    }

    #[must_use]
    pub fn write(txid: u32, timestamp: u64, data: Value) -> Self {
        Self { kind: RecordKind::Write, txid, timestamp, data: Some(data), stable: None }
    }

    #[must_use]
    pub fn update(txid: u32, timestamp: u64, data: Value) -> Self {
        Self { kind: RecordKind::Update, txid, timestamp, data: Some(data), stable: None }
    }

    #[must_use]
    pub fn delete(txid: u32, timestamp: u64) -> Self {
        Self { kind: RecordKind::Delete, txid, timestamp, data: None, stable: None }
    }

    #[must_use]
    pub fn commit(txid: u32, timestamp: u64) -> Self {
        Self { kind: RecordKind::Commit, txid, timestamp, data: None, stable: Some(true) }
    }

    #[must_use]
    pub fn abort(txid: u32, timestamp: u64) -> Self {
        Self { kind: RecordKind::Abort, txid, timestamp, data: None, stable: None }
    }

    /// A record is well-formed if it round-trips through JSON with its
    /// required fields intact.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        match self.kind {
            RecordKind::Write | RecordKind::Update => self.data.is_some(),
            _ => true,
        }
    }
}
