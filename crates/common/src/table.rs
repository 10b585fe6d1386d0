//! Table and schema-change-element metadata.

use std::fmt;

use crate::{
    codec,
    key::Key,
};

/// A non-partitioned table or a single partition: the unit the backfill
/// pipeline runs over.
#[derive(Clone, Debug)]
pub struct PhysicalTable {
    pub physical_id: i64,
    pub schema_name: String,
    pub table_name: String,
}

impl PhysicalTable {
    pub fn new(
        physical_id: i64,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            physical_id,
            schema_name: schema_name.into(),
            table_name: table_name.into(),
        }
    }

    pub fn record_prefix(&self) -> Key {
        codec::record_prefix(self.physical_id)
    }

    pub fn index_root_prefix(&self) -> Key {
        codec::index_root_prefix(self.physical_id)
    }

    pub fn index_prefix(&self, index_id: i64) -> Key {
        codec::index_prefix(self.physical_id, index_id)
    }
}

impl fmt::Display for PhysicalTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} (physical {})",
            self.schema_name, self.table_name, self.physical_id
        )
    }
}

/// Metadata of the index an add-index or merge-index job builds: which
/// index, over which column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexInfo {
    pub id: i64,
    pub column_id: i64,
}

/// The column identity swap a modify-column job performs: rows are
/// rewritten with the old column's value converted and stored under the
/// new column id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnChange {
    pub old_column_id: i64,
    pub new_column_id: i64,
}

/// What kind of object a schema-change element refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementKind {
    Index,
    Column,
}

/// The index or column a reorg job is currently building. A job may cover
/// several elements; the pipeline runs one at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Element {
    pub id: i64,
    pub kind: ElementKind,
}

impl Element {
    pub fn index(id: i64) -> Self {
        Self {
            id,
            kind: ElementKind::Index,
        }
    }

    pub fn column(id: i64) -> Self {
        Self {
            id,
            kind: ElementKind::Column,
        }
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ElementKind::Index => write!(f, "index {}", self.id),
            ElementKind::Column => write!(f, "column {}", self.id),
        }
    }
}
