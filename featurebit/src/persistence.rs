use crate::batch::{Batch, Column};
use crate::error::{FeatureStoreError, StoreError};
use crate::online_store::{OnlineStore, WriteRow};
use crate::registry::Registry;
use crate::retrieval::{FeatureRef, OnlineResponse};
use crate::retry::retry_with_delay;
use crate::schema::{EntityKey, EntityRow};
use crate::settings::PersistenceSettings;
use crate::value::Value;
use crate::{debug, error, info, warn};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};
use tokio::task::JoinHandle;

/// Outputs of persisted on demand views computed for one request.
///
/// `computed` columns are named `<odfv>__<field>` (or just `<field>`), aligned with `entity_rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateJob {
    pub computed: Batch,
    pub feature_refs: Vec<FeatureRef>,
    pub entity_rows: Vec<EntityRow>,
    pub computed_at: DateTime<Utc>,
}

impl UpdateJob {
    /// Job from an already computed response; references that failed are left out.
    pub fn from_response(response: &OnlineResponse, entity_rows: &[EntityRow], computed_at: DateTime<Utc>) -> UpdateJob {
        let mut computed = Batch::new(response.num_rows());
        let mut feature_refs = Vec::new();
        for feature in &response.features {
            if response.errors.contains_key(&feature.feature_ref.to_string()) {
                continue;
            }
            let column = Column::new(feature.feature_ref.qualified(), feature.values.clone());
            if computed.push_column(column).is_ok() {
                feature_refs.push(feature.feature_ref.clone());
            }
        }
        UpdateJob { computed, feature_refs, entity_rows: entity_rows.to_vec(), computed_at }
    }
}

pub enum PersistCommand {
    Update(UpdateJob),
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("persistence queue is full")]
    QueueFull,
    #[error("persistence worker has stopped")]
    Closed,
}

/// Producer side of the persistence queue. Submitting never blocks.
#[derive(Clone)]
pub struct PersistenceHandle {
    sender: Sender<PersistCommand>,
}

impl PersistenceHandle {
    pub fn submit(&self, job: UpdateJob) -> Result<(), SubmitError> {
        self.sender.try_send(PersistCommand::Update(job)).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::QueueFull,
            TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub jobs: usize,
    pub failed_jobs: usize,
    pub rows_written: usize,
    pub cells_applied: usize,
    pub skipped_refs: usize,
}

/// Single consumer that writes computed on demand outputs into their backing tables.
/// Run one per set of backing tables.
pub struct PersistenceWorker {
    handle: PersistenceHandle,
    task: JoinHandle<WorkerStats>,
}

impl PersistenceWorker {
    /// Starts the worker on the current tokio runtime.
    pub fn spawn(registry: Arc<dyn Registry>, store: Arc<dyn OnlineStore>, settings: &PersistenceSettings) -> Self {
        let (sender, receiver) = mpsc::channel(settings.queue_capacity.max(1));
        let attempts = settings.write_attempts;
        let delay = Duration::from_millis(settings.retry_delay_ms);
        let task = tokio::spawn(run(registry, store, receiver, attempts, delay));
        Self { handle: PersistenceHandle { sender }, task }
    }

    pub fn handle(&self) -> PersistenceHandle {
        self.handle.clone()
    }

    /// Sends the stop signal after everything queued so far and waits for the worker to exit.
    pub async fn stop(self) -> Result<WorkerStats, FeatureStoreError> {
        if self.handle.sender.send(PersistCommand::Stop).await.is_err() {
            debug!("Persistence worker already stopped");
        }
        Ok(self.task.await?)
    }
}

async fn run(
    registry: Arc<dyn Registry>,
    store: Arc<dyn OnlineStore>,
    mut receiver: Receiver<PersistCommand>,
    attempts: usize,
    delay: Duration,
) -> WorkerStats {
    info!("Persistence worker started");
    let mut stats = WorkerStats::default();
    while let Some(command) = receiver.recv().await {
        let job = match command {
            PersistCommand::Update(job) => job,
            PersistCommand::Stop => break,
        };
        stats.jobs += 1;
        let plan = plan_job(registry.as_ref(), &job);
        stats.skipped_refs += plan.skipped_refs;
        let mut failed = false;
        for write in plan.writes {
            let table = Arc::new(write.table);
            let rows = Arc::new(write.rows);
            let result = retry_with_delay(attempts, delay, StoreError::is_retryable, || {
                let store = store.clone();
                let table = table.clone();
                let rows = rows.clone();
                async move {
                    match tokio::task::spawn_blocking(move || store.write_batch(&table, &rows)).await {
                        Ok(result) => result,
                        Err(e) => Err(StoreError::Custom(format!("write task failed: {}", e))),
                    }
                }
            })
            .await;
            match result {
                Ok(summary) => {
                    stats.rows_written += summary.rows;
                    stats.cells_applied += summary.applied_cells;
                }
                Err(e) => {
                    failed = true;
                    error!("Persisting {} rows into {} failed: {}", rows.len(), table, e);
                }
            }
        }
        if failed {
            stats.failed_jobs += 1;
        }
    }
    info!("Persistence worker stopped after {} jobs", stats.jobs);
    stats
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableWrite {
    pub table: String,
    pub rows: Vec<WriteRow>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JobPlan {
    pub writes: Vec<TableWrite>,
    pub skipped_refs: usize,
}

/// Turns a job into one write per backing table. References to anything but a persisted
/// on demand view are skipped.
pub fn plan_job(registry: &dyn Registry, job: &UpdateJob) -> JobPlan {
    let mut by_view: Vec<(&str, usize)> = Vec::new();
    for feature_ref in &job.feature_refs {
        match by_view.iter_mut().find(|(v, _)| *v == feature_ref.view) {
            Some((_, count)) => *count += 1,
            None => by_view.push((feature_ref.view.as_str(), 1)),
        }
    }

    let mut plan = JobPlan::default();
    if job.entity_rows.len() != job.computed.num_rows() {
        warn!("Update job has {} entity rows but {} computed rows, skipping", job.entity_rows.len(), job.computed.num_rows());
        plan.skipped_refs = job.feature_refs.len();
        return plan;
    }

    for (view_name, ref_count) in by_view {
        let odfv = match registry.get_on_demand_feature_view(view_name) {
            Ok(odfv) if odfv.is_persisted() => odfv,
            _ => {
                warn!("Skipping update of {}: not a persisted on demand feature view", view_name);
                plan.skipped_refs += ref_count;
                continue;
            }
        };
        let Some(backing) = odfv.backing_feature_view() else {
            plan.skipped_refs += ref_count;
            continue;
        };
        let lookup_column = |name: &str| job.computed.column(&format!("{}__{}", odfv.name, name)).or_else(|| job.computed.column(name));

        let key_specs = backing.join_key_specs();
        let feature_columns: Vec<(&str, &Column)> = backing
            .features()
            .into_iter()
            .filter_map(|f| lookup_column(&f.name).map(|c| (f.name.as_str(), c)))
            .collect();
        if feature_columns.is_empty() {
            warn!("Update job carries no columns of {}", odfv.name);
            plan.skipped_refs += ref_count;
            continue;
        }

        let mut rows = Vec::with_capacity(job.entity_rows.len());
        for (idx, entity_row) in job.entity_rows.iter().enumerate() {
            let entity_key = EntityKey::build(&key_specs, |k| entity_row.get(k).or_else(|| lookup_column(k).map(|c| &c.values()[idx])));
            let entity_key = match entity_key {
                Ok(key) => key,
                Err(e) => {
                    warn!("Skipping row {} of {}: {}", idx, odfv.name, e);
                    continue;
                }
            };
            let values: BTreeMap<String, Value> = feature_columns.iter().map(|(name, c)| (name.to_string(), c.values()[idx].clone())).collect();
            rows.push(WriteRow { entity_key, values, event_ts: job.computed_at, created_ts: job.computed_at });
        }
        if !rows.is_empty() {
            plan.writes.push(TableWrite { table: backing.name.clone(), rows });
        }
    }
    plan
}

#[cfg(test)]
mod persistence_tests {
    use super::*;
    use crate::model::{Entity, FeatureView, FileSource, OnDemandFeatureView};
    use crate::online_store::{InMemoryOnlineStore, TableRef};
    use crate::registry::{RegistryObject, RegistrySnapshot};
    use crate::schema::Field;
    use crate::transform::BoxError;
    use crate::value::ValueType;
    use chrono::TimeZone;

    fn identity(b: &Batch) -> Result<Batch, BoxError> {
        Ok(b.clone())
    }

    fn registry() -> Arc<dyn Registry> {
        let customer = Entity::new("customer", vec!["customer_id"]).with_value_type(ValueType::String);
        let profile = FeatureView::new(
            "customer_profile",
            vec![customer.clone()],
            vec![Field::new("age", ValueType::Int64)],
            None,
            FileSource::new("profile_src", "profile.parquet"),
        )
        .expect("view");
        let rating = OnDemandFeatureView::builder("rating")
            .source_view(profile.clone())
            .field("customer_id", ValueType::String)
            .field("score", ValueType::Int64)
            .transform(identity)
            .persist(vec![customer], "rating_fv", "rating_push", FileSource::new("rating_src", "rating.parquet"))
            .build()
            .expect("odfv");
        Arc::new(RegistrySnapshot::from_objects(vec![RegistryObject::from(profile), rating.into()]).expect("registry"))
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("ts")
    }

    fn job(score: i64, at: i64) -> UpdateJob {
        UpdateJob {
            computed: Batch::from_columns(vec![
                Column::new("rating__customer_id", vec![Value::from("5")]),
                Column::new("rating__score", vec![Value::Int64(score)]),
            ])
            .expect("batch"),
            feature_refs: vec![FeatureRef::new("rating", "customer_id"), FeatureRef::new("rating", "score")],
            entity_rows: vec![EntityRow::new().with("customer_id", "5")],
            computed_at: ts(at),
        }
    }

    fn settings(capacity: usize) -> PersistenceSettings {
        PersistenceSettings { enabled: true, queue_capacity: capacity, write_attempts: 1, retry_delay_ms: 0 }
    }

    fn read_score(store: &InMemoryOnlineStore) -> Option<Value> {
        store
            .read_batch(&TableRef::new("rating_fv", None), &[EntityKey::single("customer_id", "5")])
            .expect("read")
            .remove(0)
            .and_then(|row| row.values.get("score").cloned())
    }

    #[test]
    fn plan_writes_backing_table() {
        let plan = plan_job(registry().as_ref(), &job(9, 100));
        assert_eq!(plan.skipped_refs, 0);
        assert_eq!(plan.writes.len(), 1);
        let write = &plan.writes[0];
        assert_eq!(write.table, "rating_fv");
        assert_eq!(write.rows[0].entity_key, EntityKey::single("customer_id", "5"));
        assert_eq!(write.rows[0].values, BTreeMap::from([("score".to_string(), Value::Int64(9))]));
        assert_eq!(write.rows[0].event_ts, ts(100));
    }

    #[test]
    fn plan_skips_non_persisted_refs() {
        let mut j = job(9, 100);
        j.feature_refs.push(FeatureRef::new("customer_profile", "age"));
        let plan = plan_job(registry().as_ref(), &j);
        assert_eq!(plan.skipped_refs, 1);
        assert_eq!(plan.writes.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_jobs_are_idempotent() {
        let store = Arc::new(InMemoryOnlineStore::new());
        let worker = PersistenceWorker::spawn(registry(), store.clone(), &settings(8));
        let handle = worker.handle();
        handle.submit(job(9, 100)).expect("submit");
        handle.submit(job(9, 100)).expect("submit");
        let stats = worker.stop().await.expect("stop");
        assert_eq!(stats.jobs, 2);
        assert_eq!(stats.cells_applied, 1);
        assert_eq!(read_score(&store), Some(Value::Int64(9)));
    }

    #[tokio::test]
    async fn older_job_does_not_regress_value() {
        let store = Arc::new(InMemoryOnlineStore::new());
        let worker = PersistenceWorker::spawn(registry(), store.clone(), &settings(8));
        let handle = worker.handle();
        handle.submit(job(10, 200)).expect("submit");
        handle.submit(job(1, 100)).expect("submit");
        worker.stop().await.expect("stop");
        assert_eq!(read_score(&store), Some(Value::Int64(10)));
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let (sender, _receiver) = mpsc::channel(1);
        let handle = PersistenceHandle { sender };
        handle.submit(job(1, 1)).expect("first fits");
        assert_eq!(handle.submit(job(2, 2)).unwrap_err(), SubmitError::QueueFull);
    }

    #[tokio::test]
    async fn submit_after_stop_is_closed() {
        let worker = PersistenceWorker::spawn(registry(), Arc::new(InMemoryOnlineStore::new()), &settings(4));
        let handle = worker.handle();
        worker.stop().await.expect("stop");
        assert_eq!(handle.submit(job(1, 1)).unwrap_err(), SubmitError::Closed);
    }
}
