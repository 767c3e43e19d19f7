//! Row schema definitions and DDL generation
//!
//! Every entity type owns one table. A subtype's table shares the primary
//! key of its parent's table (`id REFERENCES parent(id)`), so the row schema
//! of a type is the chain of tables from the root type down to itself.
//! Root tables also carry the concrete type tag of each row:
//!
//! ```text
//! test_class(id, type_tag, foo, str_field)
//! subclass(id -> test_class.id, bar)
//! many_to_many_test_related(id, owner_id, target_id)
//! ```

use crate::descriptor::{ColumnType, FieldDescriptor, OnDelete};
use crate::naming::quote;

/// Primary key column of every table
pub const PK_COLUMN: &str = "id";

/// Root-table column holding the concrete type of each row
pub const TYPE_COLUMN: &str = "type_tag";

/// Foreign key target of a column
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignRef {
    pub table: String,
    pub on_delete: OnDelete,
}

/// One column of an entity table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Property the column stores
    pub field: String,
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub max_length: Option<usize>,
    pub references: Option<ForeignRef>,
}

impl Column {
    fn definition(&self) -> String {
        let name = quote(&self.name);
        let mut def = format!("{} {}", name, self.column_type.sql_type(self.max_length));
        if !self.nullable {
            def.push_str(" NOT NULL");
        }
        if let (ColumnType::Text, Some(len)) = (self.column_type, self.max_length) {
            def.push_str(&format!(" CHECK (length({}) <= {})", name, len));
        }
        if let Some(fk) = &self.references {
            def.push_str(&format!(
                " REFERENCES {}({}) ON DELETE {}",
                quote(&fk.table),
                quote(PK_COLUMN),
                fk.on_delete.as_sql()
            ));
        }
        def
    }
}

/// Join table backing a many-relationship
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    /// Property the join table stores
    pub field: String,
    pub name: String,
    pub owner_table: String,
    pub target_table: String,
}

impl JoinTable {
    pub fn create_statements(&self) -> Vec<String> {
        let table = quote(&self.name);
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\n    \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n    \"owner_id\" INTEGER NOT NULL REFERENCES {owner}(\"id\") ON DELETE CASCADE,\n    \"target_id\" INTEGER NOT NULL REFERENCES {target}(\"id\") ON DELETE CASCADE\n)",
                table = table,
                owner = quote(&self.owner_table),
                target = quote(&self.target_table),
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}(\"owner_id\")",
                quote(&format!("idx_{}_owner", self.name)),
                table
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}(\"target_id\")",
                quote(&format!("idx_{}_target", self.name)),
                table
            ),
        ]
    }
}

/// The table one entity type adds to its row schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    /// Parent type's table, `None` for root types
    pub parent: Option<String>,
    pub columns: Vec<Column>,
    pub joins: Vec<JoinTable>,
}

impl TableSchema {
    /// Build a table from the descriptors newly declared by one entity type
    pub fn from_descriptors(name: impl Into<String>, parent: Option<String>, fields: &[FieldDescriptor]) -> Self {
        let name = name.into();
        let mut columns = Vec::new();
        let mut joins = Vec::new();

        for field in fields {
            let target_table = field.target.as_ref().map(|t| t.table.clone());
            if field.column.has_column() {
                columns.push(Column {
                    field: field.name.clone(),
                    name: field.column_name(),
                    column_type: field.column,
                    nullable: field.nullable,
                    max_length: field.max_length,
                    references: target_table.map(|table| ForeignRef {
                        table,
                        on_delete: field.on_delete.unwrap_or(OnDelete::Cascade),
                    }),
                });
            } else if let Some(target_table) = target_table {
                joins.push(JoinTable {
                    field: field.name.clone(),
                    name: format!("{}_{}", name, field.name),
                    owner_table: name.clone(),
                    target_table,
                });
            }
        }

        Self { name, parent, columns, joins }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// DDL for this table, its indexes and its join tables
    pub fn create_statements(&self) -> Vec<String> {
        let mut defs = Vec::new();
        match &self.parent {
            None => {
                defs.push(format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote(PK_COLUMN)));
                defs.push(format!("{} TEXT NOT NULL", quote(TYPE_COLUMN)));
            }
            Some(parent) => {
                defs.push(format!(
                    "{} INTEGER PRIMARY KEY REFERENCES {}({}) ON DELETE CASCADE",
                    quote(PK_COLUMN),
                    quote(parent),
                    quote(PK_COLUMN)
                ));
            }
        }
        defs.extend(self.columns.iter().map(Column::definition));

        let mut stmts = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote(&self.name),
            defs.join(",\n    ")
        )];
        if self.is_root() {
            stmts.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}({})",
                quote(&format!("idx_{}_type", self.name)),
                quote(&self.name),
                quote(TYPE_COLUMN)
            ));
        }
        for column in self.columns.iter().filter(|c| c.references.is_some()) {
            stmts.push(format!(
                "CREATE INDEX IF NOT EXISTS {} ON {}({})",
                quote(&format!("idx_{}_{}", self.name, column.name)),
                quote(&self.name),
                quote(&column.name)
            ));
        }
        for join in &self.joins {
            stmts.extend(join.create_statements());
        }
        stmts
    }
}

/// The full stored shape of one entity type: tables from root to leaf
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSchema {
    type_name: String,
    tables: Vec<TableSchema>,
}

impl RowSchema {
    /// Schema of a root entity type
    pub fn root(type_name: impl Into<String>, table: TableSchema) -> Self {
        Self {
            type_name: type_name.into(),
            tables: vec![table],
        }
    }

    /// Schema of a subtype: the parent's tables plus the subtype's own
    pub fn extend(&self, type_name: impl Into<String>, table: TableSchema) -> Self {
        let mut tables = self.tables.clone();
        tables.push(table);
        Self {
            type_name: type_name.into(),
            tables,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Tables, root first
    pub fn tables(&self) -> &[TableSchema] {
        &self.tables
    }

    pub fn root_table(&self) -> &TableSchema {
        &self.tables[0]
    }

    /// The table added by the entity type itself
    pub fn own_table(&self) -> &TableSchema {
        &self.tables[self.tables.len() - 1]
    }

    /// Locate a column anywhere in the chain: (table index, column)
    pub fn find_column(&self, name: &str) -> Option<(usize, &Column)> {
        self.tables
            .iter()
            .enumerate()
            .find_map(|(i, t)| t.columns.iter().find(|c| c.name == name).map(|c| (i, c)))
    }

    /// Join table of a many-relationship field anywhere in the chain
    pub fn join(&self, field: &str) -> Option<&JoinTable> {
        self.tables
            .iter()
            .flat_map(|t| t.joins.iter())
            .find(|j| j.field == field)
    }

    pub fn columns(&self) -> impl Iterator<Item = &Column> {
        self.tables.iter().flat_map(|t| t.columns.iter())
    }

    /// DDL for every table in the chain
    pub fn create_statements(&self) -> Vec<String> {
        self.tables.iter().flat_map(|t| t.create_statements()).collect()
    }
}
