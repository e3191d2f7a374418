//! featurebit serves online features: point lookups of materialized feature views, request time
//! on demand transformations over them, and an asynchronous worker that writes transformed outputs
//! back into their own online tables.
//!
//! Online tables live behind the [`online_store::OnlineStore`] trait, with an in memory backend and
//! a [Redb](https://github.com/cberner/redb) backend storing `bincode` encoded rows.
//! Writes are monotonic per entity key and field by event time.
//!

pub mod logger;
pub mod error;
pub mod value;
pub mod schema;
pub mod batch;
pub mod transform;
pub mod model;
pub mod registry;
pub mod clock;
pub mod online_store;
pub mod odfv;
pub mod ingest;
pub mod retrieval;
pub mod persistence;
pub mod retry;
pub mod settings;
pub mod server;
pub mod launcher;

pub use batch::{Batch, Column};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BatchError, FeatureStoreError, OdfvError, StoreError};
pub use model::{DataSource, Entity, FeatureService, FeatureView, FileSource, OnDemandFeatureView, PushSource, RequestSource};
pub use online_store::{InMemoryOnlineStore, OnlineStore, RedbOnlineStore, TableRef, WriteRow, WriteSummary};
pub use persistence::{PersistenceHandle, PersistenceWorker, UpdateJob, WorkerStats};
pub use registry::{Registry, RegistryObject, RegistrySnapshot};
pub use retrieval::{FeatureRef, FeatureSelection, FeatureStore, FieldStatus, OnlineRequest, OnlineResponse, Persist};
pub use schema::{EntityKey, EntityRow, Field, Schema};
pub use settings::Settings;
pub use transform::{BoxError, Transform};
pub use value::{CastMode, Value, ValueType};
