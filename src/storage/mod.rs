//! Storage Layer - the relational store entities are backed by
//!
//! The engine only talks to the store through the `Store` trait:
//! - rows are created, fetched by criteria, filtered and saved one at a time
//! - a bulk insert writes many rows of one schema in a single call
//! - join tables back many-relationships
//! - begin/commit/rollback nest (savepoints)
//!
//! `SqliteStore` is the bundled rusqlite implementation.

pub mod schema;
pub mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use crate::Result;
use crate::value::Cell;

pub use schema::{Column, ForeignRef, JoinTable, RowSchema, TableSchema, PK_COLUMN, TYPE_COLUMN};
pub use sqlite::SqliteStore;

/// A stored record, keyed by column name
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    type_name: String,
    pk: Option<i64>,
    cells: BTreeMap<String, Cell>,
}

impl Row {
    /// Create an empty, unsaved row of the given concrete type
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            pk: None,
            cells: BTreeMap::new(),
        }
    }

    /// Concrete entity type the row was written as
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn pk(&self) -> Option<i64> {
        self.pk
    }

    pub fn set_pk(&mut self, pk: Option<i64>) {
        self.pk = pk;
    }

    /// Cell for a column; absent columns read as `None`
    pub fn get(&self, column: &str) -> Option<&Cell> {
        self.cells.get(column)
    }

    /// Cell for a column, `Cell::Null` when absent
    pub fn cell(&self, column: &str) -> Cell {
        self.cells.get(column).cloned().unwrap_or(Cell::Null)
    }

    pub fn set(&mut self, column: impl Into<String>, cell: Cell) {
        self.cells.insert(column.into(), cell);
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Cell)> {
        self.cells.iter()
    }
}

/// Equality filters for a row lookup
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Criteria {
    pub pk: Option<i64>,
    pub columns: Vec<(String, Cell)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Match a single primary key
    pub fn by_pk(pk: i64) -> Self {
        Self { pk: Some(pk), columns: Vec::new() }
    }

    /// Match a column value
    pub fn eq(mut self, column: impl Into<String>, cell: Cell) -> Self {
        self.columns.push((column.into(), cell));
        self
    }
}

/// Counters of store calls, for observing batching and cache behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Single-row saves (insert or update)
    pub row_saves: usize,
    /// `get_row`/`filter_rows` queries
    pub fetches: usize,
    /// `bulk_insert` calls
    pub bulk_inserts: usize,
    /// Rows written by bulk inserts
    pub bulk_rows: usize,
    /// Join-table clear/add operations
    pub join_writes: usize,
    pub deletes: usize,
}

impl fmt::Display for StoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Store Statistics:")?;
        writeln!(f, "  Row saves: {}", self.row_saves)?;
        writeln!(f, "  Fetches: {}", self.fetches)?;
        writeln!(f, "  Bulk inserts: {} ({} rows)", self.bulk_inserts, self.bulk_rows)?;
        writeln!(f, "  Join writes: {}", self.join_writes)?;
        writeln!(f, "  Deletes: {}", self.deletes)
    }
}

/// The relational store an entity database is built on
pub trait Store: Send + Sync {
    /// Create tables for a row schema if they do not exist yet
    fn ensure_schema(&self, schema: &RowSchema) -> Result<()>;

    /// A fresh, unsaved row for a schema
    fn create_row(&self, schema: &RowSchema) -> Row {
        Row::new(schema.type_name())
    }

    /// Fetch the single row matching `criteria`; `Ok(None)` when absent
    fn get_row(&self, schema: &RowSchema, criteria: &Criteria) -> Result<Option<Row>>;

    /// Fetch all rows matching `criteria`, in primary-key order
    fn filter_rows(&self, schema: &RowSchema, criteria: &Criteria) -> Result<Vec<Row>>;

    /// Insert (no primary key yet) or update a row; assigns the key on insert
    fn save_row(&self, schema: &RowSchema, row: &mut Row) -> Result<()>;

    /// Insert many unsaved rows of one schema in one call
    fn bulk_insert(&self, schema: &RowSchema, rows: &mut [&mut Row]) -> Result<()>;

    /// Delete a row and everything that cascades from it
    fn delete_row(&self, schema: &RowSchema, pk: i64) -> Result<bool>;

    /// Member keys of a many-relationship, in insertion order
    fn join_members(&self, join: &JoinTable, owner: i64) -> Result<Vec<i64>>;

    /// Owner keys that list `member` in a many-relationship
    fn join_owners(&self, join: &JoinTable, member: i64) -> Result<Vec<i64>>;

    fn join_clear(&self, join: &JoinTable, owner: i64) -> Result<()>;

    fn join_add(&self, join: &JoinTable, owner: i64, member: i64) -> Result<()>;

    /// Open a (possibly nested) transaction owned by the calling thread
    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    fn stats(&self) -> StoreStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_cells() {
        let mut row = Row::new("TestClass");
        row.set("foo", Cell::Real(1.5));
        assert_eq!(row.cell("foo"), Cell::Real(1.5));
        assert_eq!(row.cell("missing"), Cell::Null);
        assert!(row.pk().is_none());
    }

    #[test]
    fn test_criteria_builder() {
        assert_eq!(Criteria::new(), Criteria::default());
        let c = Criteria::by_pk(3).eq("name", Cell::Text("x".into()));
        assert_eq!(c.pk, Some(3));
        assert_eq!(c.columns.len(), 1);
    }
}
