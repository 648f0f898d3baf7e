//! Storage contract: the uniform surface a table layer drives regardless of
//! which engine backs it.

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::Value;

use crate::catalog::{Catalog, IndexDefinition};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::fileengine::FileEngine;
use crate::wal::WalEngine;

fn unsupported(op: &str) -> Error {
    Error::Unsupported(op.to_string())
}

/// Feature names a backend may advertise via [`StorageContract::supports_feature`].
pub const FEATURE_COMPOUND_INDEX: &str = "compoundIndex";
pub const FEATURE_BATCH: &str = "batch";
pub const FEATURE_TX: &str = "tx";
pub const FEATURE_ASYNC: &str = "async";
pub const FEATURE_FILE_LOCKING: &str = "fileLocking";
pub const FEATURE_VECTOR_SEARCH: &str = "vectorSearch";
pub const FEATURE_DOCUMENT_WRITE: &str = "documentWrite";

/// Uniform storage surface. Backends that don't implement a given family
/// (per-document ops for the WAL engine, transactional ops for the binary
/// file engine) return `Error::Unsupported`; callers should check
/// [`supports_feature`](Self::supports_feature) first.
pub trait StorageContract {
    /// Reads the full logical state as one JSON value.
    ///
    /// # Errors
    /// Returns an error on I/O or deserialization failure.
    fn read(&mut self) -> Result<Value>;

    /// Replaces the full logical state.
    ///
    /// # Errors
    /// Returns an error on I/O or serialization failure.
    fn write(&mut self, value: Value) -> Result<()>;

    /// Flushes buffered state and releases resources.
    ///
    /// # Errors
    /// Returns an error on I/O failure.
    fn close(self) -> Result<()>
    where
        Self: Sized;

    /// # Errors
    /// Returns `Error::Unsupported` on a backend without per-document ops.
    fn read_document(&mut self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(unsupported("read_document"))
    }

    /// # Errors
    /// Returns `Error::Unsupported` on a backend without per-document ops.
    fn write_document(&mut self, _key: &str, _payload: &[u8]) -> Result<()> {
        Err(unsupported("write_document"))
    }

    /// # Errors
    /// Returns `Error::Unsupported` on a backend without per-document ops.
    fn remove_document(&mut self, _key: &str) -> Result<bool> {
        Err(unsupported("remove_document"))
    }

    /// # Errors
    /// Returns `Error::Unsupported` on a backend without transactions.
    fn begin(&mut self) -> Result<u32> {
        Err(unsupported("begin"))
    }

    /// # Errors
    /// Returns `Error::Unsupported` on a backend without transactions.
    fn commit(&mut self, _txid: u32) -> Result<()> {
        Err(unsupported("commit"))
    }

    /// # Errors
    /// Returns `Error::Unsupported` on a backend without transactions.
    fn abort(&mut self, _txid: u32) -> Result<()> {
        Err(unsupported("abort"))
    }

    /// # Errors
    /// Returns `Error::Unsupported` on a backend without transactions.
    fn write_in_transaction(&mut self, _txid: u32, _data: Value) -> Result<()> {
        Err(unsupported("write_in_transaction"))
    }

    /// # Errors
    /// Returns `Error::Unsupported` on a backend without transactions.
    fn update_in_transaction(&mut self, _txid: u32, _data: Value) -> Result<()> {
        Err(unsupported("update_in_transaction"))
    }

    /// # Errors
    /// Returns `Error::Unsupported` on a backend without transactions.
    fn delete_in_transaction(&mut self, _txid: u32) -> Result<()> {
        Err(unsupported("delete_in_transaction"))
    }

    /// # Errors
    /// Returns an error if the catalog rewrite fails, or `UniqueConstraint`
    /// if `unique` is set and an existing document already conflicts.
    fn create_index(&mut self, table_name: &str, field: &str, unique: bool) -> Result<()>;

    /// # Errors
    /// Returns an error if the catalog rewrite fails, or `UniqueConstraint`
    /// if `unique` is set and an existing document already conflicts.
    fn create_compound_index(&mut self, table_name: &str, fields: &[String], unique: bool) -> Result<()>;

    /// # Errors
    /// Returns an error if the catalog rewrite fails.
    fn drop_index(&mut self, name: &str) -> Result<()>;

    fn list_indexes(&self, table_name: Option<&str>) -> Vec<IndexDefinition>;

    fn check_unique(&mut self, table_name: &str, field: &str, value: &Value, exclude_doc: Option<&str>) -> Result<bool>;

    fn check_compound_unique(
        &mut self,
        table_name: &str,
        fields: &[String],
        values: &[Value],
        exclude_doc: Option<&str>,
    ) -> Result<bool>;

    fn supports_feature(&self, name: &str) -> bool;
}

/// Finds the value of the first duplicate composite key among `docs`,
/// excluding `exclude_doc`.
fn scan_duplicate(docs: impl Iterator<Item = (String, Value)>, fields: &[String], exclude_doc: Option<&str>) -> Option<String> {
    let mut seen = HashSet::new();
    for (doc_id, doc) in docs {
        if exclude_doc == Some(doc_id.as_str()) {
            continue;
        }
        let composite: Vec<String> = fields.iter().map(|f| doc.get(f).map_or_else(|| "null".to_string(), ToString::to_string)).collect();
        let key = composite.join("\u{1}");
        if !seen.insert(key) {
            return Some(composite.join(","));
        }
    }
    None
}

fn matches_fields(doc: &Value, fields: &[String], values: &[Value]) -> bool {
    fields.iter().zip(values).all(|(f, v)| doc.get(f) == Some(v))
}

/// [`StorageContract`] backed by the binary file engine: per-document reads
/// and writes, no transactions.
pub struct DocumentStore {
    engine: FileEngine,
    catalog: Catalog,
}

impl DocumentStore {
    /// # Errors
    /// Returns an error if the file engine or catalog sidecar cannot be opened.
    pub fn open(path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let path = path.into();
        let catalog = Catalog::open(&path, config.use_msgpack)?;
        let engine = FileEngine::open(&path, config)?;
        Ok(Self { engine, catalog })
    }

    fn table_documents(&mut self, table_name: &str) -> Result<Vec<(String, Value)>> {
        let prefix = format!("{table_name}:");
        let entries = self.engine.get_all_entries()?;
        let mut out = Vec::new();
        for (key, bytes) in entries {
            if let Some(doc_id) = key.strip_prefix(&prefix) {
                out.push((doc_id.to_string(), serde_json::from_slice(&bytes)?));
            }
        }
        Ok(out)
    }
}

impl StorageContract for DocumentStore {
    fn read(&mut self) -> Result<Value> {
        let mut map = serde_json::Map::new();
        for (key, bytes) in self.engine.get_all_entries()? {
            map.insert(key, serde_json::from_slice(&bytes)?);
        }
        Ok(Value::Object(map))
    }

    fn write(&mut self, value: Value) -> Result<()> {
        let Value::Object(map) = value else {
            return Err(Error::InvalidFormat("write expects a JSON object keyed by qualified document id".to_string()));
        };
        for (key, doc) in map {
            self.engine.write_document(&key, &serde_json::to_vec(&doc)?)?;
        }
        Ok(())
    }

    fn close(mut self) -> Result<()> {
        self.engine.sync()
    }

    fn read_document(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        self.engine.read_document(key)
    }

    fn write_document(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        self.engine.write_document(key, payload)
    }

    fn remove_document(&mut self, key: &str) -> Result<bool> {
        self.engine.remove_document(key)
    }

    fn create_index(&mut self, table_name: &str, field: &str, unique: bool) -> Result<()> {
        self.create_compound_index(table_name, std::slice::from_ref(&field.to_string()), unique)
    }

    fn create_compound_index(&mut self, table_name: &str, fields: &[String], unique: bool) -> Result<()> {
        let docs = self.table_documents(table_name)?;
        self.catalog.create_compound_index(table_name, fields, unique, || {
            Ok(scan_duplicate(docs.into_iter(), fields, None))
        })
    }

    fn drop_index(&mut self, name: &str) -> Result<()> {
        self.catalog.drop_index(name)
    }

    fn list_indexes(&self, table_name: Option<&str>) -> Vec<IndexDefinition> {
        self.catalog.list_indexes(table_name).into_iter().cloned().collect()
    }

    fn check_unique(&mut self, table_name: &str, field: &str, value: &Value, exclude_doc: Option<&str>) -> Result<bool> {
        self.check_compound_unique(table_name, std::slice::from_ref(&field.to_string()), std::slice::from_ref(value), exclude_doc)
    }

    fn check_compound_unique(
        &mut self,
        table_name: &str,
        fields: &[String],
        values: &[Value],
        exclude_doc: Option<&str>,
    ) -> Result<bool> {
        let docs = self.table_documents(table_name)?;
        let conflict = docs
            .into_iter()
            .any(|(doc_id, doc)| exclude_doc != Some(doc_id.as_str()) && matches_fields(&doc, fields, values));
        Ok(!conflict)
    }

    fn supports_feature(&self, name: &str) -> bool {
        matches!(name, FEATURE_COMPOUND_INDEX | FEATURE_BATCH | FEATURE_FILE_LOCKING | FEATURE_DOCUMENT_WRITE)
    }
}

/// [`StorageContract`] backed by the WAL engine: transactions and MVCC reads,
/// no standalone per-document API (documents live inside the JSON snapshot).
pub struct TransactionalStore {
    wal: WalEngine,
    catalog: Catalog,
}

impl TransactionalStore {
    /// # Errors
    /// Returns an error if the WAL engine or catalog sidecar cannot be opened.
    pub fn open(path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let path = path.into();
        let catalog = Catalog::open(&path, config.use_msgpack)?;
        let wal = WalEngine::open(&path, config)?;
        Ok(Self { wal, catalog })
    }

    fn table_documents(&self, table_name: &str) -> Vec<(String, Value)> {
        self.wal
            .read()
            .get(table_name)
            .and_then(Value::as_object)
            .map(|docs| docs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }
}

impl StorageContract for TransactionalStore {
    fn read(&mut self) -> Result<Value> {
        Ok(self.wal.read())
    }

    fn write(&mut self, value: Value) -> Result<()> {
        let txid = self.wal.begin()?;
        self.wal.write(txid, value)?;
        self.wal.commit(txid)
    }

    fn close(mut self) -> Result<()> {
        self.wal.flush()
    }

    fn begin(&mut self) -> Result<u32> {
        self.wal.begin()
    }

    fn commit(&mut self, txid: u32) -> Result<()> {
        self.wal.commit(txid)
    }

    fn abort(&mut self, txid: u32) -> Result<()> {
        self.wal.abort(txid)
    }

    fn write_in_transaction(&mut self, txid: u32, data: Value) -> Result<()> {
        self.wal.write(txid, data)
    }

    fn update_in_transaction(&mut self, txid: u32, data: Value) -> Result<()> {
        self.wal.update(txid, data)
    }

    fn delete_in_transaction(&mut self, txid: u32) -> Result<()> {
        self.wal.delete(txid)
    }

    fn create_index(&mut self, table_name: &str, field: &str, unique: bool) -> Result<()> {
        self.create_compound_index(table_name, std::slice::from_ref(&field.to_string()), unique)
    }

    fn create_compound_index(&mut self, table_name: &str, fields: &[String], unique: bool) -> Result<()> {
        let docs = self.table_documents(table_name);
        self.catalog.create_compound_index(table_name, fields, unique, || {
            Ok(scan_duplicate(docs.into_iter(), fields, None))
        })
    }

    fn drop_index(&mut self, name: &str) -> Result<()> {
        self.catalog.drop_index(name)
    }

    fn list_indexes(&self, table_name: Option<&str>) -> Vec<IndexDefinition> {
        self.catalog.list_indexes(table_name).into_iter().cloned().collect()
    }

    fn check_unique(&mut self, table_name: &str, field: &str, value: &Value, exclude_doc: Option<&str>) -> Result<bool> {
        Ok(self.wal.check_unique(table_name, field, value, exclude_doc))
    }

    fn check_compound_unique(
        &mut self,
        table_name: &str,
        fields: &[String],
        values: &[Value],
        exclude_doc: Option<&str>,
    ) -> Result<bool> {
        Ok(self.wal.check_compound_unique(table_name, fields, values, exclude_doc))
    }

    fn supports_feature(&self, name: &str) -> bool {
        matches!(name, FEATURE_COMPOUND_INDEX | FEATURE_BATCH | FEATURE_TX | FEATURE_FILE_LOCKING)
    }
}
