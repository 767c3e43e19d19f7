//! Scalar fields stored directly in a column

use chrono::{DateTime, Utc};
use crate::descriptor::{ColumnType, FieldBinding, FieldDescriptor};
use crate::entity::Entity;
use crate::value::{Cell, Value};
use crate::{Error, Result};
use super::{mismatch, FieldProxy};

/// Numbers, text, booleans and timestamps
#[derive(Debug, Clone)]
pub struct ScalarProxy {
    descriptor: FieldDescriptor,
}

impl ScalarProxy {
    pub fn new(binding: &FieldBinding) -> Self {
        Self {
            descriptor: binding.resolve_descriptor(),
        }
    }

    fn from_cell(&self, cell: Cell) -> Result<Value> {
        let value = match (self.descriptor.column, cell) {
            (_, Cell::Null) => Value::Null,
            (ColumnType::Real, Cell::Real(v)) => Value::Float(v),
            (ColumnType::Real, Cell::Integer(v)) => Value::Float(v as f64),
            (ColumnType::Boolean, Cell::Integer(v)) => Value::Bool(v != 0),
            (ColumnType::Timestamp, Cell::Text(s)) => {
                let parsed = DateTime::parse_from_rfc3339(&s).map_err(|_| Error::TypeMismatch {
                    property: self.descriptor.name.clone(),
                    expected: "timestamp".into(),
                    found: s.clone(),
                })?;
                Value::Timestamp(parsed.with_timezone(&Utc))
            }
            (_, Cell::Integer(v)) => Value::Integer(v),
            (_, Cell::Real(v)) => Value::Float(v),
            (_, Cell::Text(s)) => Value::Text(s),
        };
        Ok(value)
    }
}

impl FieldProxy for ScalarProxy {
    fn field_descriptor(&self) -> &FieldDescriptor {
        &self.descriptor
    }

    fn get(&self, entity: &Entity) -> Result<Value> {
        let cell = entity.read_cell(&self.descriptor.column_name())?;
        self.from_cell(cell)
    }

    fn set(&self, entity: &Entity, value: &Value) -> Result<()> {
        let cell = self.to_cell(value)?;
        entity.write_cell(&self.descriptor.column_name(), cell)
    }

    fn to_cell(&self, value: &Value) -> Result<Cell> {
        let cell = match (self.descriptor.column, value) {
            (_, Value::Null) => Cell::Null,
            (ColumnType::Real, Value::Float(v)) => Cell::Real(*v),
            (ColumnType::Real, Value::Integer(v)) => Cell::Real(*v as f64),
            (ColumnType::Integer, Value::Integer(v)) => Cell::Integer(*v),
            (ColumnType::Boolean, Value::Bool(v)) => Cell::Integer(i64::from(*v)),
            (ColumnType::Text, Value::Text(v)) => Cell::Text(v.clone()),
            (ColumnType::Timestamp, Value::Timestamp(v)) => Cell::Text(v.to_rfc3339()),
            _ => return Err(mismatch(&self.descriptor, value)),
        };
        Ok(cell)
    }
}
