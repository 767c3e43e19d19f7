//! Field descriptors - storage column/relationship specifications
//!
//! A descriptor is derived once, at type-declaration time, by merging the
//! declarer's explicit `FieldOptions` over the registry defaults for the
//! column type.

use std::fmt;
use crate::value::ValueType;

/// Storage representation of one property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Real,
    Boolean,
    Text,
    Timestamp,
    /// Serialized structured value
    Json,
    /// Single-entity reference stored as a key of the target row
    ForeignKey,
    /// Many-entity reference stored in a join table, no column of its own
    ManyToMany,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Boolean => "boolean",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Json => "json",
            ColumnType::ForeignKey => "foreign_key",
            ColumnType::ManyToMany => "many_to_many",
        }
    }

    /// SQL type used in generated DDL
    pub fn sql_type(&self, max_length: Option<usize>) -> String {
        match self {
            ColumnType::Integer | ColumnType::Boolean | ColumnType::ForeignKey => "INTEGER".to_string(),
            ColumnType::Real => "REAL".to_string(),
            ColumnType::Text => match max_length {
                Some(len) => format!("VARCHAR({})", len),
                None => "TEXT".to_string(),
            },
            ColumnType::Timestamp | ColumnType::Json => "TEXT".to_string(),
            ColumnType::ManyToMany => String::new(),
        }
    }

    /// Whether this field points at rows of another entity type
    pub fn is_relationship(&self) -> bool {
        matches!(self, ColumnType::ForeignKey | ColumnType::ManyToMany)
    }

    /// Whether this field occupies a column in the owner's table
    pub fn has_column(&self) -> bool {
        !matches!(self, ColumnType::ManyToMany)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happens to referencing rows when the referenced row is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OnDelete {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

impl OnDelete {
    pub fn as_sql(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
            OnDelete::Restrict => "RESTRICT",
            OnDelete::NoAction => "NO ACTION",
        }
    }
}

/// Related name that disables the reverse accessor
pub const NO_REVERSE: &str = "+";

/// Explicit or default column arguments; `None` means "not specified"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldOptions {
    pub max_length: Option<usize>,
    pub nullable: Option<bool>,
    pub on_delete: Option<OnDelete>,
    pub related_name: Option<String>,
}

impl FieldOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_length(mut self, len: usize) -> Self {
        self.max_length = Some(len);
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        self.on_delete = Some(on_delete);
        self
    }

    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    /// Options with `self` taking precedence over `defaults`
    pub fn merged_over(&self, defaults: &FieldOptions) -> FieldOptions {
        FieldOptions {
            max_length: self.max_length.or(defaults.max_length),
            nullable: self.nullable.or(defaults.nullable),
            on_delete: self.on_delete.or(defaults.on_delete),
            related_name: self.related_name.clone().or_else(|| defaults.related_name.clone()),
        }
    }
}

/// Referenced entity type of a relationship field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTarget {
    pub type_name: String,
    pub table: String,
}

/// Resolved storage specification of one property
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Property name
    pub name: String,
    pub column: ColumnType,
    pub max_length: Option<usize>,
    pub nullable: bool,
    pub on_delete: Option<OnDelete>,
    pub related_name: Option<String>,
    pub target: Option<FieldTarget>,
}

impl FieldDescriptor {
    /// Column name in the owning table (`<name>_id` for foreign keys)
    pub fn column_name(&self) -> String {
        match self.column {
            ColumnType::ForeignKey => format!("{}_id", self.name),
            _ => self.name.clone(),
        }
    }

    /// Reverse accessor name, if the relationship exposes one
    pub fn reverse_name(&self) -> Option<&str> {
        self.related_name
            .as_deref()
            .filter(|name| *name != NO_REVERSE)
    }
}

/// Everything a field proxy is constructed from
#[derive(Debug, Clone)]
pub struct FieldBinding {
    pub property: String,
    pub declaring_type: String,
    pub value_type: ValueType,
    pub column: ColumnType,
    /// Explicit overrides supplied by the declarer
    pub options: FieldOptions,
    /// Registry defaults for `column`
    pub defaults: FieldOptions,
    pub target: Option<FieldTarget>,
}

impl FieldBinding {
    /// Merge explicit overrides with registry defaults into a descriptor
    pub fn resolve_descriptor(&self) -> FieldDescriptor {
        let merged = self.options.merged_over(&self.defaults);
        FieldDescriptor {
            name: self.property.clone(),
            column: self.column,
            max_length: merged.max_length,
            nullable: merged.nullable.unwrap_or(false),
            on_delete: merged.on_delete,
            related_name: merged.related_name,
            target: self.target.clone(),
        }
    }
}
