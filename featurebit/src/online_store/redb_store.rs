use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::info;
use crate::online_store::{is_live, OnlineRow, OnlineStore, StoredRow, TableRef, WriteRow, WriteSummary};
use crate::schema::EntityKey;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Durable store with one redb table per feature view. Rows are bincode encoded [`StoredRow`]s
/// keyed by the bincode form of the entity key.
pub struct RedbOnlineStore {
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
}

fn table_name(view: &str) -> String {
    format!("online__{}", view)
}

fn cache_size_bytes(cache_size_mb: usize) -> usize {
    cache_size_mb.saturating_mul(1024 * 1024)
}

impl RedbOnlineStore {
    pub fn create(path: impl AsRef<Path>, cache_size_mb: usize) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        if path.exists() {
            info!("Opening existing online store at {:?}", path);
        }
        let db = Database::builder().set_cache_size(cache_size_bytes(cache_size_mb)).create(path)?;
        Ok(Self::from_database(Arc::new(db)))
    }

    pub fn from_database(db: Arc<Database>) -> Self {
        Self { db, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl OnlineStore for RedbOnlineStore {
    fn write_batch(&self, table: &str, rows: &[WriteRow]) -> Result<WriteSummary, StoreError> {
        let name = table_name(table);
        let table_def = TableDefinition::<&[u8], &[u8]>::new(&name);
        let mut summary = WriteSummary::default();
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(table_def)?;
            for row in rows {
                let key = row.entity_key.to_bytes()?;
                let mut stored: StoredRow = match table.get(key.as_slice())? {
                    Some(guard) => bincode::deserialize(guard.value())?,
                    None => StoredRow::default(),
                };
                let (applied, dropped) = stored.merge(row);
                if applied > 0 {
                    let bytes = bincode::serialize(&stored)?;
                    table.insert(key.as_slice(), bytes.as_slice())?;
                }
                summary.absorb(WriteSummary { rows: 1, applied_cells: applied, dropped_cells: dropped });
            }
        }
        write_tx.commit()?;
        Ok(summary)
    }

    fn read_batch(&self, table: &TableRef, keys: &[EntityKey]) -> Result<Vec<Option<OnlineRow>>, StoreError> {
        let name = table_name(&table.name);
        let table_def = TableDefinition::<&[u8], &[u8]>::new(&name);
        let read_tx = self.db.begin_read()?;
        let stored_table = match read_tx.open_table(table_def) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(vec![None; keys.len()]),
            Err(e) => return Err(e.into()),
        };
        let now = self.clock.now();
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            let bytes = key.to_bytes()?;
            let stored: Option<StoredRow> = match stored_table.get(bytes.as_slice())? {
                Some(guard) => Some(bincode::deserialize(guard.value())?),
                None => None,
            };
            let row = stored.and_then(|s| s.into_online_row(key.clone())).filter(|r| is_live(r.event_ts, table.ttl, now));
            result.push(row);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod redb_store_tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::value::Value;
    use chrono::{DateTime, TimeZone, Utc};
    use rand::seq::SliceRandom;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("ts")
    }

    fn db_path(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("featurebit/{}_{}.redb", prefix, rand::random::<u64>()))
    }

    fn write(id: &str, temperature: i32, event: i64) -> WriteRow {
        WriteRow {
            entity_key: EntityKey::single("location_id", Value::Int32(id.parse().expect("id"))),
            values: BTreeMap::from([("temperature".to_string(), Value::Int32(temperature))]),
            event_ts: ts(event),
            created_ts: ts(event),
        }
    }

    fn key(id: i32) -> EntityKey {
        EntityKey::single("location_id", Value::Int32(id))
    }

    #[test]
    fn rows_survive_reopen() {
        let path = db_path("reopen");
        {
            let store = RedbOnlineStore::create(&path, 1).expect("store");
            store.write_batch("location_stats", &[write("1", 4, 100)]).expect("write");
        }
        let store = RedbOnlineStore::create(&path, 1).expect("reopen");
        let rows = store.read_batch(&TableRef::new("location_stats", None), &[key(1), key(2)]).expect("read");
        assert_eq!(rows[0].as_ref().expect("row").values["temperature"], Value::Int32(4));
        assert!(rows[1].is_none());
    }

    #[test]
    fn writes_are_monotonic_by_event_time() {
        let store = RedbOnlineStore::create(db_path("monotonic"), 1).expect("store");
        store.write_batch("t", &[write("1", 10, 200)]).expect("write");
        let summary = store.write_batch("t", &[write("1", 5, 150), write("2", 7, 150)]).expect("write");
        assert_eq!(summary, WriteSummary { rows: 2, applied_cells: 1, dropped_cells: 1 });
        let rows = store.read_batch(&TableRef::new("t", None), &[key(1), key(2)]).expect("read");
        assert_eq!(rows[0].as_ref().expect("row").values["temperature"], Value::Int32(10));
        assert_eq!(rows[1].as_ref().expect("row").values["temperature"], Value::Int32(7));
    }

    #[test]
    fn unknown_table_reads_absent() {
        let store = RedbOnlineStore::create(db_path("absent"), 1).expect("store");
        assert_eq!(store.read_batch(&TableRef::new("nope", None), &[key(1)]).expect("read"), vec![None]);
    }

    #[test]
    fn concurrent_writers_keep_newest_event() {
        let store = Arc::new(RedbOnlineStore::create(db_path("concurrent"), 1).expect("store"));
        let mut events: Vec<i64> = (1..=48).collect();
        events.shuffle(&mut rand::rng());
        std::thread::scope(|scope| {
            for chunk in events.chunks(6) {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    for event in chunk {
                        store.write_batch("t", &[write("1", *event as i32, *event)]).expect("write");
                    }
                });
            }
        });
        let rows = store.read_batch(&TableRef::new("t", None), &[key(1)]).expect("read");
        let row = rows[0].as_ref().expect("row");
        assert_eq!(row.values["temperature"], Value::Int32(48));
        assert_eq!(row.event_ts, ts(48));
    }

    #[test]
    fn huge_cache_size_saturates() {
        assert_eq!(cache_size_bytes(usize::MAX), usize::MAX);
        assert_eq!(cache_size_bytes(2), 2 * 1024 * 1024);
    }

    #[test]
    fn ttl_hides_stale_rows() {
        let clock = Arc::new(ManualClock::new(ts(500)));
        let store = RedbOnlineStore::create(db_path("ttl"), 1).expect("store").with_clock(clock.clone());
        store.write_batch("t", &[write("1", 4, 500)]).expect("write");
        let table = TableRef::new("t", Some(Duration::from_secs(10)));
        clock.set(ts(509));
        assert!(store.read_batch(&table, &[key(1)]).expect("read")[0].is_some());
        clock.set(ts(511));
        assert!(store.read_batch(&table, &[key(1)]).expect("read")[0].is_none());
    }
}
