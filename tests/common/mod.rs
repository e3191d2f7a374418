#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use featurebit::online_store::WriteRow;
use featurebit::*;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().expect("ts")
}

pub fn customer() -> Entity {
    Entity::new("customer", vec!["customer_id"]).with_value_type(ValueType::String)
}

pub fn customer_profile() -> FeatureView {
    FeatureView::new(
        "customer_profile",
        vec![customer()],
        vec![Field::new("avg_orders_day", ValueType::Float32), Field::new("age", ValueType::Int64)],
        None,
        FileSource::new("customer_profile_source", "data/customer_profile.parquet"),
    )
    .expect("customer_profile")
}

pub fn location_stats() -> FeatureView {
    FeatureView::new(
        "location_stats",
        vec![Entity::new("location", vec!["location_id"]).with_value_type(ValueType::Int32)],
        vec![Field::new("temperature", ValueType::Int32)],
        Some(std::time::Duration::from_secs(86_400)),
        PushSource::new("location_stats_push_source", FileSource::new("location_stats_source", "data/location_stats.parquet")),
    )
    .expect("location_stats")
}

pub fn customer_inputs() -> RequestSource {
    RequestSource::new("customer_request_source", vec![Field::new("customer_inp_1", ValueType::Float64)])
}

fn customer_rating(inputs: &Batch) -> Result<Batch, BoxError> {
    let avg = inputs
        .require("avg_orders_day")?
        .zip_map(inputs.require("customer_inp_1")?, "cus_specific_avg_orders_day", |avg, inp| match (avg.as_f64(), inp.as_f64()) {
            (Some(avg), Some(inp)) => Value::Float64(avg + inp),
            _ => Value::Null,
        });
    let age = inputs.require("age")?.map("cus_specific_age", |age| age.as_i64().map(|a| Value::Int64(a + 1)).unwrap_or_default());
    let ids = inputs.require("customer_id")?.clone();
    Ok(Batch::from_columns(vec![ids, avg, age])?)
}

fn broken(_: &Batch) -> Result<Batch, BoxError> {
    Err("model file not loaded".into())
}

/// Persisted into `transformed_customer_rating_fv`.
pub fn transformed_customer_rating() -> OnDemandFeatureView {
    OnDemandFeatureView::builder("transformed_customer_rating")
        .source_view(customer_profile())
        .source_request(customer_inputs())
        .field("customer_id", ValueType::String)
        .field("cus_specific_avg_orders_day", ValueType::Float64)
        .field("cus_specific_age", ValueType::Int64)
        .transform(customer_rating)
        .persist(
            vec![customer()],
            "transformed_customer_rating_fv",
            "transformed_customer_rating_push_source",
            FileSource::new("transformed_customer_rating_source", "data/transformed_customer_rating.parquet"),
        )
        .description("customer specific rating")
        .build()
        .expect("transformed_customer_rating")
}

pub fn broken_rating() -> OnDemandFeatureView {
    OnDemandFeatureView::builder("broken_rating")
        .source_view(customer_profile())
        .field("score", ValueType::Float64)
        .transform(broken)
        .build()
        .expect("broken_rating")
}

pub fn registry() -> Arc<dyn Registry> {
    let service = FeatureService::new("customer_service")
        .with_projection("customer_profile", vec!["age"])
        .with_view("transformed_customer_rating");
    let registry = RegistrySnapshot::from_objects(vec![
        RegistryObject::from(customer()),
        customer_profile().into(),
        location_stats().into(),
        transformed_customer_rating().into(),
        broken_rating().into(),
        service.into(),
    ])
    .expect("registry");
    Arc::new(registry)
}

/// `customer_id = "5"` with `avg_orders_day = 1.0`, `age = 3`.
pub fn seed_profile(store: &dyn OnlineStore, age: i64, event: i64) {
    store
        .write_batch(
            "customer_profile",
            &[WriteRow {
                entity_key: EntityKey::single("customer_id", "5"),
                values: BTreeMap::from([("avg_orders_day".to_string(), Value::Float32(1.0)), ("age".to_string(), Value::Int64(age))]),
                event_ts: ts(event),
                created_ts: ts(event),
            }],
        )
        .expect("seed customer_profile");
}

pub fn customer_row(id: &str, inp: f64) -> EntityRow {
    EntityRow::new().with("customer_id", id).with("customer_inp_1", inp)
}

pub fn temp_db_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("featurebit/{}_{}.redb", name, rand::random::<u64>()))
}
