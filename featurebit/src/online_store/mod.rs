pub mod memory;
pub mod redb_store;

use crate::error::StoreError;
use crate::model::FeatureView;
use crate::schema::EntityKey;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use memory::InMemoryOnlineStore;
pub use redb_store::RedbOnlineStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCell {
    pub value: Value,
    pub event_ts: DateTime<Utc>,
    pub created_ts: DateTime<Utc>,
}

/// Persisted form of one entity's row. Each field carries its own timestamps so that
/// writes stay monotonic per field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoredRow {
    pub cells: BTreeMap<String, StoredCell>,
}

impl StoredRow {
    /// Applies `row` field by field, keeping a stored cell whose event_ts is not older.
    /// Returns (applied, dropped) cell counts.
    pub fn merge(&mut self, row: &WriteRow) -> (usize, usize) {
        let mut applied = 0;
        let mut dropped = 0;
        for (field, value) in &row.values {
            match self.cells.get(field) {
                Some(existing) if existing.event_ts >= row.event_ts => dropped += 1,
                _ => {
                    self.cells.insert(
                        field.clone(),
                        StoredCell { value: value.clone(), event_ts: row.event_ts, created_ts: row.created_ts },
                    );
                    applied += 1;
                }
            }
        }
        (applied, dropped)
    }

    /// Newest cell timestamps of the row.
    pub fn timestamps(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        self.cells.values().max_by_key(|c| c.event_ts).map(|c| (c.event_ts, c.created_ts))
    }

    pub fn into_online_row(self, entity_key: EntityKey) -> Option<OnlineRow> {
        let (event_ts, created_ts) = self.timestamps()?;
        let values = self.cells.into_iter().map(|(k, c)| (k, c.value)).collect();
        Some(OnlineRow { entity_key, values, event_ts, created_ts })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteRow {
    pub entity_key: EntityKey,
    pub values: BTreeMap<String, Value>,
    pub event_ts: DateTime<Utc>,
    pub created_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnlineRow {
    pub entity_key: EntityKey,
    pub values: BTreeMap<String, Value>,
    pub event_ts: DateTime<Utc>,
    pub created_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteSummary {
    pub rows: usize,
    pub applied_cells: usize,
    pub dropped_cells: usize,
}

impl WriteSummary {
    pub fn absorb(&mut self, other: WriteSummary) {
        self.rows += other.rows;
        self.applied_cells += other.applied_cells;
        self.dropped_cells += other.dropped_cells;
    }
}

/// Identifies the table to read and how long its rows stay valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub ttl: Option<Duration>,
}

impl TableRef {
    pub fn new(name: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self { name: name.into(), ttl }
    }

    pub fn of(view: &FeatureView) -> Self {
        Self::new(view.name.clone(), view.ttl)
    }
}

/// Key value table per feature view. Writes are monotonic per entity key and field by
/// event time, reads hide rows older than the table's ttl.
pub trait OnlineStore: Send + Sync {
    fn write_batch(&self, table: &str, rows: &[WriteRow]) -> Result<WriteSummary, StoreError>;

    /// One slot per key, in key order; `None` when the key has no live row.
    fn read_batch(&self, table: &TableRef, keys: &[EntityKey]) -> Result<Vec<Option<OnlineRow>>, StoreError>;
}

/// A row is live while `event_ts >= now - ttl`; no ttl or a zero ttl never expires.
pub fn is_live(event_ts: DateTime<Utc>, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
    match ttl {
        None => true,
        Some(ttl) if ttl.is_zero() => true,
        Some(ttl) => match chrono::Duration::from_std(ttl) {
            Ok(ttl) => match now.checked_sub_signed(ttl) {
                Some(cutoff) => event_ts >= cutoff,
                None => true,
            },
            Err(_) => true,
        },
    }
}
