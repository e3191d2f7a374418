use crate::error::BatchError;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    name: String,
    values: Vec<Value>,
}

impl Column {
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self { name: name.into(), values }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn map(&self, name: impl Into<String>, f: impl Fn(&Value) -> Value) -> Column {
        Column::new(name, self.values.iter().map(f).collect())
    }

    pub fn zip_map(&self, other: &Column, name: impl Into<String>, f: impl Fn(&Value, &Value) -> Value) -> Column {
        Column::new(name, self.values.iter().zip(other.values.iter()).map(|(a, b)| f(a, b)).collect())
    }
}

/// Column oriented table exchanged between retrieval and transforms.
///
/// Every column holds exactly `num_rows` values and column names are unique.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Batch {
    num_rows: usize,
    columns: Vec<Column>,
}

impl Batch {
    pub fn new(num_rows: usize) -> Self {
        Self { num_rows, columns: Vec::new() }
    }

    pub fn from_columns(columns: Vec<Column>) -> Result<Batch, BatchError> {
        let num_rows = columns.first().map(|c| c.len()).unwrap_or(0);
        let mut batch = Batch::new(num_rows);
        for column in columns {
            batch.push_column(column)?;
        }
        Ok(batch)
    }

    /// Builds a batch from row maps, columns ordered by name; a column missing from a row is null.
    pub fn from_rows(rows: &[BTreeMap<String, Value>]) -> Batch {
        let names: Vec<&String> = {
            let mut seen = HashSet::new();
            let mut names: Vec<&String> = rows.iter().flat_map(|r| r.keys()).filter(|k| seen.insert(*k)).collect();
            names.sort();
            names
        };
        let columns = names
            .into_iter()
            .map(|name| Column::new(name.clone(), rows.iter().map(|r| r.get(name).cloned().unwrap_or_default()).collect()))
            .collect();
        Batch { num_rows: rows.len(), columns }
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn require(&self, name: &str) -> Result<&Column, BatchError> {
        self.column(name).ok_or_else(|| BatchError::ColumnNotFound(name.to_string()))
    }

    pub fn push_column(&mut self, column: Column) -> Result<(), BatchError> {
        if column.len() != self.num_rows {
            return Err(BatchError::LengthMismatch { name: column.name, expected: self.num_rows, actual: column.values.len() });
        }
        if self.contains(&column.name) {
            return Err(BatchError::DuplicateColumn(column.name));
        }
        self.columns.push(column);
        Ok(())
    }

    pub fn with_column(mut self, name: impl Into<String>, values: Vec<Value>) -> Result<Batch, BatchError> {
        self.push_column(Column::new(name, values))?;
        Ok(self)
    }

    /// Horizontal concatenation. On a name collision the column of `self` is kept.
    pub fn merge_columns(&self, other: &Batch) -> Result<Batch, BatchError> {
        if other.columns.is_empty() {
            return Ok(self.clone());
        }
        if self.columns.is_empty() {
            return Ok(other.clone());
        }
        if self.num_rows != other.num_rows {
            let name = other.columns.first().map(|c| c.name.clone()).unwrap_or_default();
            return Err(BatchError::LengthMismatch { name, expected: self.num_rows, actual: other.num_rows });
        }
        let mut merged = self.clone();
        for column in &other.columns {
            if !merged.contains(&column.name) {
                merged.columns.push(column.clone());
            }
        }
        Ok(merged)
    }

    /// Keeps only `names`, in that order.
    pub fn project(&self, names: &[&str]) -> Result<Batch, BatchError> {
        let mut projected = Batch::new(self.num_rows);
        for name in names {
            projected.push_column(self.require(name)?.clone())?;
        }
        Ok(projected)
    }

    pub fn row(&self, idx: usize) -> Option<BTreeMap<String, Value>> {
        if idx >= self.num_rows {
            return None;
        }
        Some(self.columns.iter().map(|c| (c.name.clone(), c.values[idx].clone())).collect())
    }

    pub fn rows(&self) -> Vec<BTreeMap<String, Value>> {
        (0..self.num_rows).filter_map(|i| self.row(i)).collect()
    }
}
