use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::online_store::{is_live, OnlineRow, OnlineStore, StoredRow, TableRef, WriteRow, WriteSummary};
use crate::schema::EntityKey;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type Table = HashMap<Vec<u8>, StoredRow>;

/// Process local store. The merge of a write runs under the table's write lock.
pub struct InMemoryOnlineStore {
    tables: RwLock<HashMap<String, Arc<RwLock<Table>>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOnlineStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOnlineStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { tables: RwLock::new(HashMap::new()), clock }
    }

    fn table(&self, name: &str) -> Result<Option<Arc<RwLock<Table>>>, StoreError> {
        Ok(self.tables.read()?.get(name).cloned())
    }

    fn table_or_create(&self, name: &str) -> Result<Arc<RwLock<Table>>, StoreError> {
        if let Some(table) = self.table(name)? {
            return Ok(table);
        }
        let mut tables = self.tables.write()?;
        Ok(tables.entry(name.to_string()).or_default().clone())
    }
}

impl OnlineStore for InMemoryOnlineStore {
    fn write_batch(&self, table: &str, rows: &[WriteRow]) -> Result<WriteSummary, StoreError> {
        let table = self.table_or_create(table)?;
        let mut guard = table.write()?;
        let mut summary = WriteSummary::default();
        for row in rows {
            let key = row.entity_key.to_bytes()?;
            let (applied, dropped) = guard.entry(key).or_default().merge(row);
            summary.absorb(WriteSummary { rows: 1, applied_cells: applied, dropped_cells: dropped });
        }
        Ok(summary)
    }

    fn read_batch(&self, table: &TableRef, keys: &[EntityKey]) -> Result<Vec<Option<OnlineRow>>, StoreError> {
        let Some(stored) = self.table(&table.name)? else {
            return Ok(vec![None; keys.len()]);
        };
        let guard = stored.read()?;
        let now = self.clock.now();
        keys.iter()
            .map(|key| -> Result<Option<OnlineRow>, StoreError> {
                let row = guard.get(&key.to_bytes()?).cloned().and_then(|r| r.into_online_row(key.clone()));
                Ok(row.filter(|r| is_live(r.event_ts, table.ttl, now)))
            })
            .collect()
    }
}

#[cfg(test)]
mod memory_tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::value::Value;
    use chrono::{DateTime, TimeZone, Utc};
    use rand::seq::SliceRandom;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("ts")
    }

    fn row(id: &str, fields: Vec<(&str, Value)>, event: i64) -> WriteRow {
        WriteRow {
            entity_key: EntityKey::single("customer_id", id),
            values: fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect::<BTreeMap<_, _>>(),
            event_ts: ts(event),
            created_ts: ts(event),
        }
    }

    #[test]
    fn older_write_does_not_regress_value() {
        let store = InMemoryOnlineStore::new();
        store.write_batch("t", &[row("5", vec![("age", Value::Int64(4))], 200)]).expect("write");
        let summary = store.write_batch("t", &[row("5", vec![("age", Value::Int64(3))], 100)]).expect("write");
        assert_eq!(summary, WriteSummary { rows: 1, applied_cells: 0, dropped_cells: 1 });
        let read = store.read_batch(&TableRef::new("t", None), &[EntityKey::single("customer_id", "5")]).expect("read");
        let got = read[0].as_ref().expect("row");
        assert_eq!(got.values["age"], Value::Int64(4));
        assert_eq!(got.event_ts, ts(200));
    }

    #[test]
    fn partial_write_keeps_other_fields() {
        let store = InMemoryOnlineStore::new();
        store.write_batch("t", &[row("5", vec![("age", Value::Int64(3)), ("avg", Value::Float64(1.0))], 100)]).expect("write");
        store.write_batch("t", &[row("5", vec![("age", Value::Int64(5))], 150)]).expect("write");
        let read = store.read_batch(&TableRef::new("t", None), &[EntityKey::single("customer_id", "5")]).expect("read");
        let got = read[0].as_ref().expect("row");
        assert_eq!(got.values["age"], Value::Int64(5));
        assert_eq!(got.values["avg"], Value::Float64(1.0));
    }

    #[test]
    fn unknown_keys_and_tables_are_absent() {
        let store = InMemoryOnlineStore::new();
        let keys = [EntityKey::single("customer_id", "1"), EntityKey::single("customer_id", "2")];
        assert_eq!(store.read_batch(&TableRef::new("missing", None), &keys).expect("read"), vec![None, None]);
        store.write_batch("t", &[row("2", vec![("age", Value::Int64(1))], 10)]).expect("write");
        let read = store.read_batch(&TableRef::new("t", None), &keys).expect("read");
        assert!(read[0].is_none());
        assert!(read[1].is_some());
    }

    #[test]
    fn concurrent_writers_keep_newest_event() {
        let store = Arc::new(InMemoryOnlineStore::new());
        let mut events: Vec<i64> = (1..=64).collect();
        events.shuffle(&mut rand::rng());
        std::thread::scope(|scope| {
            for chunk in events.chunks(8) {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for event in chunk {
                        store.write_batch("t", &[row("5", vec![("age", Value::Int64(*event))], *event)]).expect("write");
                    }
                });
            }
        });
        let read = store.read_batch(&TableRef::new("t", None), &[EntityKey::single("customer_id", "5")]).expect("read");
        let got = read[0].as_ref().expect("row");
        assert_eq!(got.values["age"], Value::Int64(64));
        assert_eq!(got.event_ts, ts(64));
    }

    #[test]
    fn expired_rows_are_absent() {
        let clock = Arc::new(ManualClock::new(ts(1_000)));
        let store = InMemoryOnlineStore::with_clock(clock.clone());
        store.write_batch("t", &[row("5", vec![("age", Value::Int64(3))], 1_000)]).expect("write");
        let table = TableRef::new("t", Some(Duration::from_secs(60)));
        let key = [EntityKey::single("customer_id", "5")];
        clock.set(ts(1_059));
        assert!(store.read_batch(&table, &key).expect("read")[0].is_some());
        clock.set(ts(1_061));
        assert!(store.read_batch(&table, &key).expect("read")[0].is_none());
    }
}
