//! Minimal schema description consumed by the storage contract.
//!
//! Validation against a schema is out of scope here; this type only carries
//! enough structure for a storage implementation to know which indexes and
//! relations a table declares.

use serde::{Deserialize, Serialize};

/// A compound uniqueness group: several fields whose combination must be
/// unique together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundGroup {
    pub fields: Vec<String>,
}

/// A cascade relation from this table to another: deleting a document here
/// implies an action on matching documents in `target_table`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeRelation {
    pub target_table: String,
    pub foreign_field: String,
}

/// A schema declaration for one table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaSpec {
    pub table_name: String,
    pub unique_fields: Vec<String>,
    pub compound_groups: Vec<CompoundGroup>,
    pub vector_fields: Vec<String>,
    pub cascades: Vec<CascadeRelation>,
}

impl SchemaSpec {
    #[must_use]
    pub fn new(table_name: impl Into<String>) -> Self {
        Self { table_name: table_name.into(), ..Default::default() }
    }

    #[must_use]
    pub fn has_vector_fields(&self) -> bool {
        !self.vector_fields.is_empty()
    }
}
