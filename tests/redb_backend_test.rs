mod common;

use common::*;
use featurebit::settings::{OnlineStoreSettings, Settings};
use featurebit::*;
use std::sync::Arc;

fn location_push(temperature: i64, event: i64) -> Batch {
    Batch::from_columns(vec![
        Column::new("location_id", vec![Value::Int64(1)]),
        Column::new("temperature", vec![Value::Int64(temperature)]),
        Column::new("event_timestamp", vec![Value::UnixTimestamp(ts(event))]),
    ])
    .expect("batch")
}

fn temperature(store: &FeatureStore) -> Vec<Value> {
    store
        .get_online_features(&OnlineRequest::new(["location_stats:temperature"], vec![EntityRow::new().with("location_id", 1i64)]))
        .expect("response")
        .to_dict()
        .remove("temperature")
        .expect("temperature")
}

#[test]
fn redb_store_serves_pushed_rows_across_reopen() {
    let path = temp_db_path("location_stats");
    let clock = Arc::new(ManualClock::new(ts(1_700_000_000)));
    {
        let online = RedbOnlineStore::create(&path, 8).expect("store").with_clock(clock.clone());
        let store = FeatureStore::new(registry(), Arc::new(online)).with_clock(clock.clone());
        store.push("location_stats_push_source", &location_push(4, 1_700_000_000)).expect("push");
        let late = store.push("location_stats_push_source", &location_push(1, 1_600_000_000)).expect("late push");
        assert_eq!(late.dropped_cells, 1);
        assert_eq!(temperature(&store), vec![Value::Int32(4)]);
    }

    let online = RedbOnlineStore::create(&path, 8).expect("reopen").with_clock(clock.clone());
    let store = FeatureStore::new(registry(), Arc::new(online));
    assert_eq!(temperature(&store), vec![Value::Int32(4)]);

    // location_stats keeps rows for one day
    clock.advance(chrono::Duration::seconds(86_401));
    assert_eq!(temperature(&store), vec![Value::Null]);
}

#[test]
fn settings_build_configured_backend() {
    let mut settings = Settings::default();
    settings.online_store = OnlineStoreSettings::Redb { path: temp_db_path("settings").to_string_lossy().into_owned(), cache_size_mb: 4 };
    let online = settings.build_online_store().expect("store");
    let store = FeatureStore::new(registry(), online);
    store.push("location_stats_push_source", &location_push(7, chrono::Utc::now().timestamp())).expect("push");
    assert_eq!(temperature(&store), vec![Value::Int32(7)]);
}
