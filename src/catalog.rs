//! Index catalog: persisted index definitions surviving restart.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::fsutil;

/// One registered index: single-field or compound, optionally unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub table_name: String,
    pub fields: Vec<String>,
    pub unique: bool,
}

impl IndexDefinition {
    #[must_use]
    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }
}

/// The catalog's persisted form: a flat list of definitions, rewritten
/// atomically via a tmp-file-plus-rename on every create/drop.
pub struct Catalog {
    path: PathBuf,
    msgpack: bool,
    definitions: Vec<IndexDefinition>,
}

impl Catalog {
    /// Loads the catalog sidecar for `data_path`, or starts empty if absent.
    ///
    /// # Errors
    /// Returns an error if the sidecar exists but cannot be parsed.
    pub fn open(data_path: &Path, msgpack: bool) -> Result<Self> {
        let path = fsutil::catalog_path(data_path, msgpack);
        let definitions = if path.exists() {
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            if bytes.is_empty() {
                Vec::new()
            } else if msgpack {
                rmp_serde::from_slice(&bytes)?
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            Vec::new()
        };
        Ok(Self { path, msgpack, definitions })
    }

    #[must_use]
    pub fn list_indexes(&self, table_name: Option<&str>) -> Vec<&IndexDefinition> {
        self.definitions.iter().filter(|d| table_name.is_none_or(|t| d.table_name == t)).collect()
    }

    /// Registers a single-field index. `unique_scan` is called to validate
    /// uniqueness across existing documents before the definition is
    /// persisted, when `unique` is set.
    ///
    /// # Errors
    /// Returns `Error::UniqueConstraint` if `unique` is set and `unique_scan`
    /// reports a duplicate, or an I/O error if the rewrite fails.
    pub fn create_index(
        &mut self,
        table_name: &str,
        field: &str,
        unique: bool,
        unique_scan: impl FnOnce() -> Result<Option<String>>,
    ) -> Result<()> {
        self.create_compound_index(table_name, std::slice::from_ref(&field.to_string()), unique, unique_scan)
    }

    /// Registers a compound index over several fields.
    ///
    /// # Errors
    /// Returns `Error::UniqueConstraint` if `unique` is set and `unique_scan`
    /// reports a duplicate, or an I/O error if the rewrite fails.
    pub fn create_compound_index(
        &mut self,
        table_name: &str,
        fields: &[String],
        unique: bool,
        unique_scan: impl FnOnce() -> Result<Option<String>>,
    ) -> Result<()> {
        if unique {
            if let Some(dup_value) = unique_scan()? {
                return Err(Error::UniqueConstraint { field: fields.join(","), value: dup_value });
            }
        }
        let name = Self::index_name(table_name, fields);
        if let Some(existing) = self.definitions.iter_mut().find(|d| d.name == name) {
            existing.unique = unique;
        } else {
            self.definitions.push(IndexDefinition {
                name,
                table_name: table_name.to_string(),
                fields: fields.to_vec(),
                unique,
            });
        }
        self.persist()
    }

    /// Removes the named index. No-op if it does not exist.
    ///
    /// # Errors
    /// Returns an error if the rewrite fails.
    pub fn drop_index(&mut self, name: &str) -> Result<()> {
        self.definitions.retain(|d| d.name != name);
        self.persist()
    }

    fn index_name(table_name: &str, fields: &[String]) -> String {
        format!("{table_name}:{}", fields.join("+"))
    }

    fn persist(&self) -> Result<()> {
        let bytes = if self.msgpack {
            rmp_serde::to_vec(&self.definitions)?
        } else {
            serde_json::to_vec(&self.definitions)?
        };
        let tmp = self.path.with_extension("tmp");
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fsutil::atomic_replace(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_list_round_trips() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("db.bmdb");
        let mut catalog = Catalog::open(&data_path, false).unwrap();
        catalog.create_index("users", "email", true, || Ok(None)).unwrap();
        catalog.create_compound_index("orders", &["user_id".into(), "status".into()], false, || Ok(None)).unwrap();
        let defs = catalog.list_indexes(Some("users"));
        assert_eq!(defs.len(), 1);
        assert!(defs[0].unique);
        assert_eq!(catalog.list_indexes(None).len(), 2);
    }

    #[test]
    fn unique_violation_blocks_creation() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("db.bmdb");
        let mut catalog = Catalog::open(&data_path, false).unwrap();
        let err = catalog.create_index("users", "email", true, || Ok(Some("a@b".to_string()))).unwrap_err();
        assert!(matches!(err, Error::UniqueConstraint { .. }));
        assert!(catalog.list_indexes(None).is_empty());
    }

    #[test]
    fn drop_index_removes_it_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("db.bmdb");
        {
            let mut catalog = Catalog::open(&data_path, false).unwrap();
            catalog.create_index("users", "email", true, || Ok(None)).unwrap();
        }
        let mut reopened = Catalog::open(&data_path, false).unwrap();
        assert_eq!(reopened.list_indexes(None).len(), 1);
        let name = reopened.list_indexes(None)[0].name.clone();
        reopened.drop_index(&name).unwrap();
        assert!(reopened.list_indexes(None).is_empty());
        let reopened_again = Catalog::open(&data_path, false).unwrap();
        assert!(reopened_again.list_indexes(None).is_empty());
    }

    #[test]
    fn compound_index_name_distinguishes_field_order() {
        let dir = tempdir().unwrap();
        let data_path = dir.path().join("db.bmdb");
        let mut catalog = Catalog::open(&data_path, false).unwrap();
        catalog.create_compound_index("t", &["a".into(), "b".into()], false, || Ok(None)).unwrap();
        catalog.create_compound_index("t", &["b".into(), "a".into()], false, || Ok(None)).unwrap();
        assert_eq!(catalog.list_indexes(Some("t")).len(), 2);
    }
}
