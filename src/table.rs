//! Result tables.
//!
//! A [`DataTable`] is built incrementally: the first batch defines the
//! columns, later batches only append rows. [`ResultSets`] is the
//! collection of tables produced by one command, shared between the
//! connection and whoever displays the results.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::error::{SqtError, SqtResult};
use crate::protocol::{FieldDescription, type_name};
use crate::types::{Alignment, TypeMapper, Value, ValueKind};

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataColumn {
    pub name: String,
    pub kind: ValueKind,
    /// Server type OID
    pub type_id: u32,
    /// `typname` for built-in types, empty otherwise
    pub type_name: &'static str,
    /// Byte width reported by the server, negative for variable length
    pub size: i16,
    pub decimal_digits: Option<u16>,
    pub nullable: bool,
    pub alignment: Alignment,
}

impl DataColumn {
    /// Describe a column from a RowDescription field.
    pub fn from_field(field: &FieldDescription, mapper: &dyn TypeMapper) -> Self {
        Self {
            name: field.name.clone(),
            kind: mapper.value_kind(field.type_oid),
            type_id: field.type_oid,
            type_name: type_name(field.type_oid).unwrap_or_default(),
            size: field.type_size,
            decimal_digits: mapper.decimal_digits(field.type_oid, field.type_modifier),
            // the protocol has no column-level nullability
            nullable: true,
            alignment: mapper.alignment(field.type_oid),
        }
    }
}

pub type DataRow = Vec<Value>;

/// How a table stopped growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableState {
    /// Rows may still arrive.
    Open,
    Complete,
    /// Frozen by an error; no more rows are accepted.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataTable {
    columns: Vec<DataColumn>,
    rows: Vec<DataRow>,
    state: TableState,
}

impl Default for DataTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTable {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            state: TableState::Open,
        }
    }

    pub fn columns(&self) -> &[DataColumn] {
        &self.columns
    }

    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    pub fn value(&self, row: usize, column: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Define the columns if this is the first batch, otherwise check the
    /// batch has the same column count. A mismatch freezes the table.
    pub fn define_columns(&mut self, columns: Vec<DataColumn>) -> SqtResult<()> {
        if self.columns.is_empty() && self.rows.is_empty() {
            self.columns = columns;
            return Ok(());
        }
        self.check_width(columns.len())
    }

    /// Append one row. A row wider or narrower than the table freezes it.
    pub fn append_row(&mut self, row: DataRow) -> SqtResult<()> {
        if self.state == TableState::Failed {
            return Err(SqtError::protocol("result table is frozen"));
        }
        self.check_width(row.len())?;
        self.rows.push(row);
        Ok(())
    }

    fn check_width(&mut self, found: usize) -> SqtResult<()> {
        let expected = self.columns.len();
        if found != expected {
            self.state = TableState::Failed;
            return Err(SqtError::ColumnMismatch { expected, found });
        }
        Ok(())
    }

    pub fn complete(&mut self) {
        if self.state == TableState::Open {
            self.state = TableState::Complete;
        }
    }

    pub fn fail(&mut self) {
        self.state = TableState::Failed;
    }

    /// Move all rows of `other` to the end of this table. `other` keeps its
    /// columns and ends up empty.
    pub fn take_rows(&mut self, other: &mut DataTable) -> SqtResult<()> {
        if self.columns.is_empty() && self.rows.is_empty() {
            self.columns = other.columns.clone();
        }
        self.check_width(other.columns.len())?;
        self.rows.append(&mut other.rows);
        Ok(())
    }
}

/// Reference to a table in a [`ResultSets`] collection plus the row count at
/// the moment of the reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRef {
    pub index: usize,
    pub rows: usize,
}

/// Result tables of the current command, shared across threads.
#[derive(Debug, Clone, Default)]
pub struct ResultSets {
    inner: Arc<Mutex<Vec<DataTable>>>,
}

impl ResultSets {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<DataTable>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Add a table, returning its index.
    pub fn push(&self, table: DataTable) -> usize {
        let mut tables = self.lock();
        tables.push(table);
        tables.len() - 1
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run `f` on the table at `index`, if it exists.
    pub fn with_table<R>(&self, index: usize, f: impl FnOnce(&DataTable) -> R) -> Option<R> {
        self.lock().get(index).map(f)
    }

    pub fn with_table_mut<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut DataTable) -> R,
    ) -> Option<R> {
        self.lock().get_mut(index).map(f)
    }

    /// Copy of every table.
    pub fn snapshot(&self) -> Vec<DataTable> {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::oid;
    use crate::types::PgTypeMapper;
    use pretty_assertions::assert_eq;

    fn column(name: &str, type_oid: u32) -> DataColumn {
        let field = FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid,
            type_size: 4,
            type_modifier: -1,
            format: 0,
        };
        DataColumn::from_field(&field, &PgTypeMapper)
    }

    #[test]
    fn test_column_from_field() {
        let col = column("id", oid::INT4);
        assert_eq!(col.kind, ValueKind::Int);
        assert_eq!(col.type_name, "int4");
        assert_eq!(col.alignment, Alignment::Right);
        assert!(col.nullable);
        assert_eq!(col.decimal_digits, None);
    }

    #[test]
    fn test_rows_keep_arrival_order() {
        let mut table = DataTable::new();
        table.define_columns(vec![column("n", oid::INT4)]).unwrap();
        for i in 0..5 {
            table.append_row(vec![Value::Int(i)]).unwrap();
        }
        let values: Vec<_> = table.rows().iter().map(|r| r[0].clone()).collect();
        assert_eq!(values, (0..5).map(Value::Int).collect::<Vec<_>>());
    }

    #[test]
    fn test_column_mismatch_freezes() {
        let mut table = DataTable::new();
        table
            .define_columns(vec![column("a", oid::INT4), column("b", oid::TEXT)])
            .unwrap();
        table
            .append_row(vec![Value::Int(1), Value::Null])
            .unwrap();

        let err = table
            .define_columns(vec![column("a", oid::INT4)])
            .unwrap_err();
        assert!(matches!(
            err,
            SqtError::ColumnMismatch {
                expected: 2,
                found: 1
            }
        ));
        assert_eq!(table.state(), TableState::Failed);
        assert!(table.append_row(vec![Value::Int(2), Value::Null]).is_err());
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.columns().len(), 2);
    }

    #[test]
    fn test_take_rows() {
        let mut src = DataTable::new();
        src.define_columns(vec![column("n", oid::INT4)]).unwrap();
        src.append_row(vec![Value::Int(1)]).unwrap();
        src.append_row(vec![Value::Int(2)]).unwrap();

        let mut dst = DataTable::new();
        dst.take_rows(&mut src).unwrap();
        assert_eq!(dst.row_count(), 2);
        assert_eq!(src.row_count(), 0);
        assert_eq!(dst.columns(), src.columns());
    }

    #[test]
    fn test_result_sets_shared() {
        let results = ResultSets::new();
        let other = results.clone();
        let index = results.push(DataTable::new());
        assert_eq!(index, 0);
        assert_eq!(other.len(), 1);

        other.with_table_mut(0, |t| t.complete());
        assert_eq!(
            results.with_table(0, |t| t.state()),
            Some(TableState::Complete)
        );

        results.clear();
        assert!(other.is_empty());
    }
}
