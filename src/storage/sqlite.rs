//! SQLite storage implementation

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension, ToSql};
use tracing::{debug, info};
use crate::naming::quote;
use crate::value::Cell;
use crate::{Error, Result};
use super::schema::{Column, JoinTable, RowSchema, PK_COLUMN, TYPE_COLUMN};
use super::{Criteria, Row, Store, StoreStats};

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Cell::Integer(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*v)),
            Cell::Real(v) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*v)),
            Cell::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

impl FromSql for Cell {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Cell::Null,
            ValueRef::Integer(v) => Cell::Integer(v),
            ValueRef::Real(v) => Cell::Real(v),
            ValueRef::Text(t) | ValueRef::Blob(t) => Cell::Text(String::from_utf8_lossy(t).into_owned()),
        })
    }
}

#[derive(Debug, Default)]
struct Counters {
    row_saves: AtomicUsize,
    fetches: AtomicUsize,
    bulk_inserts: AtomicUsize,
    bulk_rows: AtomicUsize,
    join_writes: AtomicUsize,
    deletes: AtomicUsize,
}

fn bump(counter: &AtomicUsize, by: usize) {
    counter.fetch_add(by, Ordering::Relaxed);
}

/// Thread holding the open savepoints, and how deep they go
#[derive(Debug, Default)]
struct TxOwner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// SQLite-backed entity store
///
/// One connection serves every caller; transactions opened with `begin`
/// are connection-wide savepoints owned by the opening thread. Statements
/// from any other thread wait until the owner commits or rolls back.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    tx: Mutex<TxOwner>,
    released: Condvar,
    counters: Counters,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("depth", &self.transaction_depth())
            .field("stats", &self.stats())
            .finish()
    }
}

impl SqliteStore {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, true)
    }

    /// Open a database file, choosing whether SQLite enforces foreign keys
    pub fn open_with(path: &Path, foreign_keys: bool) -> Result<Self> {
        Self::from_connection(Connection::open(path)?, foreign_keys)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, true)
    }

    fn from_connection(conn: Connection, foreign_keys: bool) -> Result<Self> {
        let pragma = if foreign_keys { "ON" } else { "OFF" };
        conn.execute_batch(&format!("PRAGMA foreign_keys = {};", pragma))?;
        Ok(Self {
            conn: Mutex::new(conn),
            tx: Mutex::new(TxOwner::default()),
            released: Condvar::new(),
            counters: Counters::default(),
        })
    }

    /// Connection for one statement, once no other thread holds a transaction
    fn conn(&self) -> MutexGuard<'_, Connection> {
        let _turn = self.wait_turn();
        self.lock_conn()
    }

    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tx_owner(&self) -> MutexGuard<'_, TxOwner> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Block while another thread owns the open savepoints
    fn wait_turn(&self) -> MutexGuard<'_, TxOwner> {
        let me = thread::current().id();
        let mut owner = self.tx_owner();
        while owner.thread.is_some_and(|t| t != me) {
            owner = self.released.wait(owner).unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        owner
    }

    /// Close one savepoint level held by the calling thread
    fn release(&self, statement: impl FnOnce(&str) -> String, verb: &str) -> Result<()> {
        let mut owner = self.tx_owner();
        if owner.depth == 0 || owner.thread != Some(thread::current().id()) {
            return Err(Error::Transaction(format!("{verb} without an open transaction")));
        }
        let name = format!("propbind_{}", owner.depth - 1);
        self.lock_conn().execute_batch(&statement(&name))?;
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            self.released.notify_all();
        }
        Ok(())
    }

    /// Run a raw statement, returning the number of changed rows
    pub fn execute(&self, sql: &str) -> Result<usize> {
        Ok(self.conn().execute(sql, [])?)
    }

    /// Count rows in a table
    pub fn count_rows(&self, table: &str) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {}", quote(table)), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Check whether a table exists
    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn()
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Current transaction nesting depth
    pub fn transaction_depth(&self) -> usize {
        self.tx_owner().depth
    }

    // ========== Query Building ==========

    /// `SELECT` over every table of a schema, joined on the shared key
    fn select_sql(schema: &RowSchema, criteria: &Criteria) -> Result<(String, Vec<Cell>)> {
        let mut fields = vec![
            format!("t0.{}", quote(PK_COLUMN)),
            format!("t0.{}", quote(TYPE_COLUMN)),
        ];
        let mut from = String::new();
        for (i, table) in schema.tables().iter().enumerate() {
            if i == 0 {
                from.push_str(&format!("{} t0", quote(&table.name)));
            } else {
                from.push_str(&format!(
                    " JOIN {} t{i} ON t{i}.{pk} = t0.{pk}",
                    quote(&table.name),
                    i = i,
                    pk = quote(PK_COLUMN)
                ));
            }
            fields.extend(table.columns.iter().map(|c| format!("t{}.{}", i, quote(&c.name))));
        }

        let mut clauses = Vec::new();
        let mut params = Vec::new();
        if let Some(pk) = criteria.pk {
            clauses.push(format!("t0.{} = ?", quote(PK_COLUMN)));
            params.push(Cell::Integer(pk));
        }
        for (name, cell) in &criteria.columns {
            let (i, column) = schema.find_column(name).ok_or_else(|| Error::UnknownProperty {
                entity: schema.type_name().to_string(),
                property: name.clone(),
            })?;
            if cell.is_null() {
                clauses.push(format!("t{}.{} IS NULL", i, quote(&column.name)));
            } else {
                clauses.push(format!("t{}.{} = ?", i, quote(&column.name)));
                params.push(cell.clone());
            }
        }

        let mut sql = format!("SELECT {} FROM {}", fields.join(", "), from);
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY t0.{}", quote(PK_COLUMN)));
        Ok((sql, params))
    }

    fn read_row(columns: &[&Column], row: &rusqlite::Row) -> rusqlite::Result<Row> {
        let mut out = Row::new(row.get::<_, String>(1)?);
        out.set_pk(Some(row.get(0)?));
        for (i, column) in columns.iter().enumerate() {
            out.set(column.name.clone(), row.get::<_, Cell>(i + 2)?);
        }
        Ok(out)
    }

    fn query(&self, schema: &RowSchema, criteria: &Criteria, limit: Option<usize>) -> Result<Vec<Row>> {
        let (mut sql, params) = Self::select_sql(schema, criteria)?;
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        let columns: Vec<&Column> = schema.columns().collect();

        bump(&self.counters.fetches, 1);
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), |row| Self::read_row(&columns, row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ========== Row Writes ==========

    fn insert(conn: &Connection, schema: &RowSchema, row: &Row) -> Result<i64> {
        let mut pk = None;
        for table in schema.tables() {
            let mut names = Vec::new();
            let mut values = Vec::new();
            match pk {
                None => {
                    names.push(quote(TYPE_COLUMN));
                    values.push(Cell::Text(row.type_name().to_string()));
                }
                Some(id) => {
                    names.push(quote(PK_COLUMN));
                    values.push(Cell::Integer(id));
                }
            }
            for column in &table.columns {
                names.push(quote(&column.name));
                values.push(row.cell(&column.name));
            }
            let placeholders = vec!["?"; names.len()].join(", ");
            conn.execute(
                &format!("INSERT INTO {} ({}) VALUES ({})", quote(&table.name), names.join(", "), placeholders),
                params_from_iter(values.iter()),
            )?;
            if pk.is_none() {
                pk = Some(conn.last_insert_rowid());
            }
        }
        Ok(pk.unwrap_or_default())
    }

    fn update(conn: &Connection, schema: &RowSchema, row: &Row, pk: i64) -> Result<()> {
        for (i, table) in schema.tables().iter().enumerate() {
            let mut sets = Vec::new();
            let mut values = Vec::new();
            if i == 0 {
                sets.push(format!("{} = ?", quote(TYPE_COLUMN)));
                values.push(Cell::Text(row.type_name().to_string()));
            }
            for column in &table.columns {
                sets.push(format!("{} = ?", quote(&column.name)));
                values.push(row.cell(&column.name));
            }
            if sets.is_empty() {
                continue;
            }
            values.push(Cell::Integer(pk));
            let changed = conn.execute(
                &format!("UPDATE {} SET {} WHERE {} = ?", quote(&table.name), sets.join(", "), quote(PK_COLUMN)),
                params_from_iter(values.iter()),
            )?;
            if changed == 0 {
                return Err(Error::StaleReference {
                    entity: schema.type_name().to_string(),
                    pk,
                });
            }
        }
        Ok(())
    }
}

impl Store for SqliteStore {
    fn ensure_schema(&self, schema: &RowSchema) -> Result<()> {
        let conn = self.conn();
        for stmt in schema.create_statements() {
            conn.execute(&stmt, [])?;
        }
        info!("Ensured tables for {}: {}", schema.type_name(), schema.own_table().name);
        Ok(())
    }

    fn get_row(&self, schema: &RowSchema, criteria: &Criteria) -> Result<Option<Row>> {
        let mut rows = self.query(schema, criteria, Some(2))?;
        if rows.len() > 1 {
            return Err(Error::MultipleRows(schema.type_name().to_string()));
        }
        Ok(rows.pop())
    }

    fn filter_rows(&self, schema: &RowSchema, criteria: &Criteria) -> Result<Vec<Row>> {
        self.query(schema, criteria, None)
    }

    fn save_row(&self, schema: &RowSchema, row: &mut Row) -> Result<()> {
        let mut conn = self.conn();
        let sp = conn.savepoint()?;
        match row.pk() {
            None => {
                let pk = Self::insert(&sp, schema, row)?;
                row.set_pk(Some(pk));
                debug!("Inserted {} #{}", schema.type_name(), pk);
            }
            Some(pk) => {
                Self::update(&sp, schema, row, pk)?;
                debug!("Updated {} #{}", schema.type_name(), pk);
            }
        }
        sp.commit()?;
        bump(&self.counters.row_saves, 1);
        Ok(())
    }

    fn bulk_insert(&self, schema: &RowSchema, rows: &mut [&mut Row]) -> Result<()> {
        let mut conn = self.conn();
        let sp = conn.savepoint()?;
        let mut written = 0;
        // Rows that already carry a key are left untouched
        for row in rows.iter_mut().filter(|r| r.pk().is_none()) {
            let pk = Self::insert(&sp, schema, row)?;
            row.set_pk(Some(pk));
            written += 1;
        }
        sp.commit()?;
        bump(&self.counters.bulk_inserts, 1);
        bump(&self.counters.bulk_rows, written);
        debug!("Bulk inserted {} {} rows", written, schema.type_name());
        Ok(())
    }

    fn delete_row(&self, schema: &RowSchema, pk: i64) -> Result<bool> {
        let mut conn = self.conn();
        let sp = conn.savepoint()?;
        let mut deleted = false;
        for table in schema.tables().iter().rev() {
            for join in &table.joins {
                sp.execute(&format!("DELETE FROM {} WHERE \"owner_id\" = ?1", quote(&join.name)), [pk])?;
            }
            deleted = sp.execute(
                &format!("DELETE FROM {} WHERE {} = ?1", quote(&table.name), quote(PK_COLUMN)),
                [pk],
            )? > 0;
        }
        sp.commit()?;
        bump(&self.counters.deletes, 1);
        Ok(deleted)
    }

    // ========== Join Operations ==========

    fn join_members(&self, join: &JoinTable, owner: i64) -> Result<Vec<i64>> {
        bump(&self.counters.fetches, 1);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT \"target_id\" FROM {} WHERE \"owner_id\" = ?1 ORDER BY \"id\"",
            quote(&join.name)
        ))?;
        let members = stmt
            .query_map([owner], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(members)
    }

    fn join_owners(&self, join: &JoinTable, member: i64) -> Result<Vec<i64>> {
        bump(&self.counters.fetches, 1);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT \"owner_id\" FROM {} WHERE \"target_id\" = ?1 ORDER BY \"owner_id\"",
            quote(&join.name)
        ))?;
        let owners = stmt
            .query_map([member], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(owners)
    }

    fn join_clear(&self, join: &JoinTable, owner: i64) -> Result<()> {
        self.conn()
            .execute(&format!("DELETE FROM {} WHERE \"owner_id\" = ?1", quote(&join.name)), [owner])?;
        bump(&self.counters.join_writes, 1);
        Ok(())
    }

    fn join_add(&self, join: &JoinTable, owner: i64, member: i64) -> Result<()> {
        self.conn().execute(
            &format!("INSERT INTO {} (\"owner_id\", \"target_id\") VALUES (?1, ?2)", quote(&join.name)),
            [owner, member],
        )?;
        bump(&self.counters.join_writes, 1);
        Ok(())
    }

    // ========== Transactions ==========

    fn begin(&self) -> Result<()> {
        let mut owner = self.wait_turn();
        self.lock_conn()
            .execute_batch(&format!("SAVEPOINT propbind_{}", owner.depth))?;
        owner.thread = Some(thread::current().id());
        owner.depth += 1;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.release(|name| format!("RELEASE SAVEPOINT {name}"), "commit")
    }

    fn rollback(&self) -> Result<()> {
        self.release(
            |name| format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};"),
            "rollback",
        )
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            row_saves: self.counters.row_saves.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            bulk_inserts: self.counters.bulk_inserts.load(Ordering::Relaxed),
            bulk_rows: self.counters.bulk_rows.load(Ordering::Relaxed),
            join_writes: self.counters.join_writes.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ColumnType, FieldDescriptor, FieldTarget};
    use crate::storage::TableSchema;

    fn field(name: &str, column: ColumnType) -> FieldDescriptor {
        FieldDescriptor {
            name: name.into(),
            column,
            max_length: if column == ColumnType::Text { Some(8) } else { None },
            nullable: false,
            on_delete: None,
            related_name: None,
            target: None,
        }
    }

    fn schemas() -> (RowSchema, RowSchema) {
        let base = RowSchema::root(
            "TestClass",
            TableSchema::from_descriptors("test_class", None, &[field("foo", ColumnType::Real), field("str_field", ColumnType::Text)]),
        );
        let sub = base.extend(
            "Subclass",
            TableSchema::from_descriptors("subclass", Some("test_class".into()), &[field("bar", ColumnType::Integer)]),
        );
        (base, sub)
    }

    fn setup() -> (SqliteStore, RowSchema, RowSchema) {
        let store = SqliteStore::open_in_memory().unwrap();
        let (base, sub) = schemas();
        store.ensure_schema(&base).unwrap();
        store.ensure_schema(&sub).unwrap();
        (store, base, sub)
    }

    fn base_row(schema: &RowSchema, foo: f64) -> Row {
        let mut row = store_row(schema);
        row.set("foo", Cell::Real(foo));
        row.set("str_field", Cell::Text("asdf".into()));
        row
    }

    fn store_row(schema: &RowSchema) -> Row {
        Row::new(schema.type_name())
    }

    #[test]
    fn test_row_crud() {
        let (store, base, _) = setup();

        let mut row = base_row(&base, 1.234);
        store.save_row(&base, &mut row).unwrap();
        let pk = row.pk().unwrap();

        let loaded = store.get_row(&base, &Criteria::by_pk(pk)).unwrap().unwrap();
        assert_eq!(loaded.type_name(), "TestClass");
        assert_eq!(loaded.cell("foo"), Cell::Real(1.234));
        assert_eq!(loaded.cell("str_field"), Cell::Text("asdf".into()));

        row.set("foo", Cell::Real(2.0));
        store.save_row(&base, &mut row).unwrap();
        assert_eq!(row.pk(), Some(pk));
        let loaded = store.get_row(&base, &Criteria::by_pk(pk)).unwrap().unwrap();
        assert_eq!(loaded.cell("foo"), Cell::Real(2.0));

        assert!(store.get_row(&base, &Criteria::by_pk(pk + 100)).unwrap().is_none());
        assert!(store.delete_row(&base, pk).unwrap());
        assert!(store.get_row(&base, &Criteria::by_pk(pk)).unwrap().is_none());
    }

    #[test]
    fn test_subtype_rows_span_tables() {
        let (store, base, sub) = setup();

        let mut row = base_row(&sub, 1.0);
        row.set("bar", Cell::Integer(5));
        store.save_row(&sub, &mut row).unwrap();
        store.save_row(&base, &mut base_row(&base, 2.0)).unwrap();

        assert_eq!(store.count_rows("test_class").unwrap(), 2);
        assert_eq!(store.count_rows("subclass").unwrap(), 1);

        let all = store.filter_rows(&base, &Criteria::new()).unwrap();
        let tags: Vec<&str> = all.iter().map(|r| r.type_name()).collect();
        assert_eq!(tags, vec!["Subclass", "TestClass"]);

        let full = store.get_row(&sub, &Criteria::by_pk(row.pk().unwrap())).unwrap().unwrap();
        assert_eq!(full.cell("bar"), Cell::Integer(5));

        store.delete_row(&sub, row.pk().unwrap()).unwrap();
        assert_eq!(store.count_rows("subclass").unwrap(), 0);
        assert_eq!(store.count_rows("test_class").unwrap(), 1);
    }

    #[test]
    fn test_criteria_and_multiple_rows() {
        let (store, base, _) = setup();
        store.save_row(&base, &mut base_row(&base, 1.0)).unwrap();
        store.save_row(&base, &mut base_row(&base, 2.0)).unwrap();

        let one = store.get_row(&base, &Criteria::new().eq("foo", Cell::Real(2.0))).unwrap().unwrap();
        assert_eq!(one.cell("foo"), Cell::Real(2.0));

        let err = store.get_row(&base, &Criteria::new().eq("str_field", Cell::Text("asdf".into()))).unwrap_err();
        assert!(matches!(err, Error::MultipleRows(_)));

        let err = store.filter_rows(&base, &Criteria::new().eq("nope", Cell::Null)).unwrap_err();
        assert!(matches!(err, Error::UnknownProperty { .. }));
    }

    #[test]
    fn test_update_of_vanished_row_is_stale() {
        let (store, base, _) = setup();
        let mut row = base_row(&base, 1.0);
        store.save_row(&base, &mut row).unwrap();
        store.execute("DELETE FROM test_class").unwrap();

        let err = store.save_row(&base, &mut row).unwrap_err();
        assert!(matches!(err, Error::StaleReference { .. }));
    }

    #[test]
    fn test_text_length_check() {
        let (store, base, _) = setup();
        let mut row = base_row(&base, 1.0);
        row.set("str_field", Cell::Text("far too long".into()));
        assert!(store.save_row(&base, &mut row).is_err());
        assert!(row.pk().is_none());
        assert_eq!(store.count_rows("test_class").unwrap(), 0);
    }

    #[test]
    fn test_bulk_insert_is_one_call() {
        let (store, base, _) = setup();
        let mut rows: Vec<Row> = (0..10).map(|i| base_row(&base, i as f64)).collect();
        let mut refs: Vec<&mut Row> = rows.iter_mut().collect();
        store.bulk_insert(&base, &mut refs).unwrap();

        assert!(rows.iter().all(|r| r.pk().is_some()));
        let stats = store.stats();
        assert_eq!(stats.bulk_inserts, 1);
        assert_eq!(stats.bulk_rows, 10);
        assert_eq!(stats.row_saves, 0);
        assert_eq!(store.count_rows("test_class").unwrap(), 10);
    }

    #[test]
    fn test_join_operations_keep_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let book = RowSchema::root("Book", TableSchema::from_descriptors("book", None, &[]));
        let mut shelf_books = field("books", ColumnType::ManyToMany);
        shelf_books.target = Some(FieldTarget { type_name: "Book".into(), table: "book".into() });
        let shelf = RowSchema::root("Shelf", TableSchema::from_descriptors("shelf", None, &[shelf_books]));
        store.ensure_schema(&book).unwrap();
        store.ensure_schema(&shelf).unwrap();

        let mut owner = store_row(&shelf);
        store.save_row(&shelf, &mut owner).unwrap();
        let owner = owner.pk().unwrap();
        let mut members = Vec::new();
        for _ in 0..4 {
            let mut row = store_row(&book);
            store.save_row(&book, &mut row).unwrap();
            members.push(row.pk().unwrap());
        }

        let join = shelf.join("books").unwrap();
        for pk in members.iter().rev() {
            store.join_add(join, owner, *pk).unwrap();
        }
        let expected: Vec<i64> = members.iter().rev().copied().collect();
        assert_eq!(store.join_members(join, owner).unwrap(), expected);
        assert_eq!(store.join_owners(join, members[0]).unwrap(), vec![owner]);

        store.join_clear(join, owner).unwrap();
        assert!(store.join_members(join, owner).unwrap().is_empty());
    }

    #[test]
    fn test_nested_transactions() {
        let (store, base, _) = setup();

        store.begin().unwrap();
        store.save_row(&base, &mut base_row(&base, 1.0)).unwrap();
        store.begin().unwrap();
        store.save_row(&base, &mut base_row(&base, 2.0)).unwrap();
        assert_eq!(store.transaction_depth(), 2);
        store.rollback().unwrap();
        store.commit().unwrap();

        assert_eq!(store.transaction_depth(), 0);
        assert_eq!(store.count_rows("test_class").unwrap(), 1);
        assert!(matches!(store.commit(), Err(Error::Transaction(_))));
    }

    #[test]
    fn test_other_threads_wait_for_open_transaction() {
        let (store, base, _) = setup();
        let store = std::sync::Arc::new(store);

        store.begin().unwrap();
        store.save_row(&base, &mut base_row(&base, 1.0)).unwrap();
        let writer = {
            let store = std::sync::Arc::clone(&store);
            let base = base.clone();
            thread::spawn(move || {
                let mut row = base_row(&base, 2.0);
                store.save_row(&base, &mut row).unwrap();
                row.pk()
            })
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!writer.is_finished());

        store.rollback().unwrap();
        assert!(writer.join().unwrap().is_some());
        assert_eq!(store.count_rows("test_class").unwrap(), 1);
        assert_eq!(store.transaction_depth(), 0);
    }

    #[test]
    fn test_commit_from_other_thread_is_rejected() {
        let (store, _, _) = setup();
        let store = std::sync::Arc::new(store);

        store.begin().unwrap();
        let other = std::sync::Arc::clone(&store);
        let result = thread::spawn(move || other.commit()).join().unwrap();
        assert!(matches!(result, Err(Error::Transaction(_))));
        store.commit().unwrap();
    }

    #[test]
    fn test_file_backed_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let (base, _) = schemas();
            store.ensure_schema(&base).unwrap();
            store.save_row(&base, &mut base_row(&base, 1.0)).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert!(store.table_exists("test_class").unwrap());
        assert!(!store.table_exists("subclass").unwrap());
        assert_eq!(store.count_rows("test_class").unwrap(), 1);
    }
}
