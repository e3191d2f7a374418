use crate::batch::{Batch, Column};
use crate::clock::{Clock, SystemClock};
use crate::error::{BatchError, FeatureStoreError, OdfvError};
use crate::model::{FeatureView, OnDemandFeatureView};
use crate::odfv::evaluate;
use crate::online_store::{OnlineRow, OnlineStore, TableRef};
use crate::persistence::{PersistenceHandle, UpdateJob};
use crate::registry::Registry;
use crate::schema::{EntityKey, EntityRow, JoinKey};
use crate::value::{CastMode, Value};
use crate::{debug, warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// `<view>:<field>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureRef {
    pub view: String,
    pub field: String,
}

impl FeatureRef {
    pub fn new(view: impl Into<String>, field: impl Into<String>) -> Self {
        Self { view: view.into(), field: field.into() }
    }

    pub fn parse(reference: &str) -> Result<FeatureRef, FeatureStoreError> {
        match reference.split_once(':') {
            Some((view, field)) if !view.is_empty() && !field.is_empty() && !field.contains(':') => Ok(FeatureRef::new(view, field)),
            _ => Err(FeatureStoreError::InvalidFeatureRef(reference.to_string())),
        }
    }

    /// Column name used with full feature names.
    pub fn qualified(&self) -> String {
        format!("{}__{}", self.view, self.field)
    }
}

impl fmt::Display for FeatureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.view, self.field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureSelection {
    Refs(Vec<String>),
    Service(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct OnlineRequest {
    pub features: FeatureSelection,
    pub entity_rows: Vec<EntityRow>,
    pub full_feature_names: bool,
}

impl OnlineRequest {
    pub fn new<I, S>(feature_refs: I, entity_rows: Vec<EntityRow>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            features: FeatureSelection::Refs(feature_refs.into_iter().map(Into::into).collect()),
            entity_rows,
            full_feature_names: false,
        }
    }

    pub fn for_service(service: impl Into<String>, entity_rows: Vec<EntityRow>) -> Self {
        Self { features: FeatureSelection::Service(service.into()), entity_rows, full_feature_names: false }
    }

    pub fn with_full_feature_names(mut self, full_feature_names: bool) -> Self {
        self.full_feature_names = full_feature_names;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persist {
    Skip,
    Async,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldStatus {
    Present,
    NullValue,
    NotFound,
    Failed,
}

impl FieldStatus {
    fn of(value: &Value) -> FieldStatus {
        if value.is_null() {
            FieldStatus::NullValue
        } else {
            FieldStatus::Present
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureColumn {
    pub name: String,
    pub feature_ref: FeatureRef,
    pub values: Vec<Value>,
    pub statuses: Vec<FieldStatus>,
    pub event_timestamps: Vec<Option<DateTime<Utc>>>,
}

impl FeatureColumn {
    fn new(name: String, feature_ref: FeatureRef, rows: usize) -> Self {
        Self {
            name,
            feature_ref,
            values: Vec::with_capacity(rows),
            statuses: Vec::with_capacity(rows),
            event_timestamps: Vec::with_capacity(rows),
        }
    }

    fn push(&mut self, value: Value, status: FieldStatus, event_ts: Option<DateTime<Utc>>) {
        self.values.push(value);
        self.statuses.push(status);
        self.event_timestamps.push(event_ts);
    }

    fn timestamp_column_name(&self) -> String {
        format!("{}__event_timestamp", self.name)
    }

    fn timestamp_values(&self) -> Vec<Value> {
        self.event_timestamps.iter().map(|ts| ts.map(Value::UnixTimestamp).unwrap_or_default()).collect()
    }
}

/// Rows aligned with the request's entity rows: propagated join keys followed by the requested features.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OnlineResponse {
    pub entity_columns: Vec<Column>,
    pub features: Vec<FeatureColumn>,
    pub errors: BTreeMap<String, OdfvError>,
}

impl OnlineResponse {
    pub fn num_rows(&self) -> usize {
        self.entity_columns.first().map(|c| c.len()).or_else(|| self.features.first().map(|f| f.values.len())).unwrap_or(0)
    }

    pub fn feature_names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn feature(&self, name: &str) -> Option<&FeatureColumn> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Error that made the values of `feature_ref` (`view:field`) fail.
    pub fn error(&self, feature_ref: &str) -> Option<&OdfvError> {
        self.errors.get(feature_ref)
    }

    pub fn to_dict(&self) -> BTreeMap<String, Vec<Value>> {
        let entities = self.entity_columns.iter().map(|c| (c.name().to_string(), c.values().to_vec()));
        let features = self.features.iter().map(|f| (f.name.clone(), f.values.clone()));
        entities.chain(features).collect()
    }

    pub fn to_records(&self, include_event_timestamps: bool) -> Vec<BTreeMap<String, Value>> {
        (0..self.num_rows())
            .map(|row| {
                let mut record = BTreeMap::new();
                for column in &self.entity_columns {
                    record.insert(column.name().to_string(), column.values()[row].clone());
                }
                for feature in &self.features {
                    record.insert(feature.name.clone(), feature.values[row].clone());
                    if include_event_timestamps {
                        let ts = feature.event_timestamps[row].map(Value::UnixTimestamp).unwrap_or_default();
                        record.insert(feature.timestamp_column_name(), ts);
                    }
                }
                record
            })
            .collect()
    }

    pub fn to_batch(&self, include_event_timestamps: bool) -> Result<Batch, BatchError> {
        let mut batch = Batch::new(self.num_rows());
        for column in &self.entity_columns {
            batch.push_column(column.clone())?;
        }
        for feature in &self.features {
            batch.push_column(Column::new(feature.name.clone(), feature.values.clone()))?;
            if include_event_timestamps {
                batch.push_column(Column::new(feature.timestamp_column_name(), feature.timestamp_values()))?;
            }
        }
        Ok(batch)
    }

    /// Feature server response shape: one result per column, entity columns first.
    pub fn to_json(&self) -> serde_json::Value {
        let rows = self.num_rows();
        let mut names = Vec::new();
        let mut results = Vec::new();
        for column in &self.entity_columns {
            names.push(column.name().to_string());
            results.push(json!({
                "values": column.values().iter().map(Value::to_json).collect::<Vec<_>>(),
                "statuses": vec![FieldStatus::Present; rows],
                "event_timestamps": vec![Value::Null.to_json(); rows],
            }));
        }
        for feature in &self.features {
            names.push(feature.name.clone());
            results.push(json!({
                "values": feature.values.iter().map(Value::to_json).collect::<Vec<_>>(),
                "statuses": feature.statuses,
                "event_timestamps": feature.timestamp_values().iter().map(Value::to_json).collect::<Vec<_>>(),
            }));
        }
        let errors: BTreeMap<&String, String> = self.errors.iter().map(|(k, e)| (k, e.to_string())).collect();
        json!({ "metadata": { "feature_names": names }, "results": results, "errors": errors })
    }
}

enum Target {
    View(Arc<FeatureView>),
    Odfv(Arc<OnDemandFeatureView>),
}

impl Target {
    fn name(&self) -> &str {
        match self {
            Target::View(v) => &v.name,
            Target::Odfv(o) => &o.name,
        }
    }

    fn join_key_specs(&self) -> Vec<JoinKey> {
        match self {
            Target::View(v) => v.join_key_specs(),
            Target::Odfv(o) => o.join_key_specs(),
        }
    }

    fn feature_names(&self) -> Vec<String> {
        match self {
            Target::View(v) => v.features().into_iter().map(|f| f.name.clone()).collect(),
            Target::Odfv(o) => o.schema.names().map(String::from).collect(),
        }
    }

    fn has_feature(&self, field: &str) -> bool {
        match self {
            Target::View(v) => v.schema.contains(field),
            Target::Odfv(o) => o.schema.contains(field),
        }
    }
}

struct Group {
    target: Target,
    refs: Vec<FeatureRef>,
}

type ReadCache = HashMap<String, Vec<Option<OnlineRow>>>;

/// Entry point for online reads and pushes. Cheap to share behind an `Arc`.
pub struct FeatureStore {
    registry: Arc<dyn Registry>,
    online_store: Arc<dyn OnlineStore>,
    persistence: Option<PersistenceHandle>,
    clock: Arc<dyn Clock>,
}

impl FeatureStore {
    pub fn new(registry: Arc<dyn Registry>, online_store: Arc<dyn OnlineStore>) -> Self {
        Self { registry, online_store, persistence: None, clock: Arc::new(SystemClock) }
    }

    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        self.persistence = Some(handle);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn online_store(&self) -> &Arc<dyn OnlineStore> {
        &self.online_store
    }

    pub fn persistence(&self) -> Option<&PersistenceHandle> {
        self.persistence.as_ref()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn get_online_features(&self, request: &OnlineRequest) -> Result<OnlineResponse, FeatureStoreError> {
        self.retrieve(request, Persist::Skip)
    }

    /// Same as [`FeatureStore::get_online_features`], and hands the freshly computed outputs of
    /// persisted on demand views to the persistence worker without waiting for the write.
    pub fn get_online_features_and_update(&self, request: &OnlineRequest) -> Result<OnlineResponse, FeatureStoreError> {
        self.retrieve(request, Persist::Async)
    }

    pub fn retrieve(&self, request: &OnlineRequest, persist: Persist) -> Result<OnlineResponse, FeatureStoreError> {
        let rows = &request.entity_rows;
        let groups = self.plan(&request.features)?;
        let now = self.clock.now();

        let mut key_specs: Vec<JoinKey> = Vec::new();
        for group in &groups {
            let specs = group.target.join_key_specs();
            entity_keys(group.target.name(), &specs, rows)?;
            for spec in specs {
                if !key_specs.iter().any(|k| k.name == spec.name) {
                    key_specs.push(spec);
                }
            }
        }
        let mut entity_columns: Vec<Column> = key_specs.iter().map(|spec| key_column(spec, rows)).collect();

        let mut cache = ReadCache::new();
        let mut features = Vec::new();
        let mut errors = BTreeMap::new();
        let mut computed: Vec<(Arc<OnDemandFeatureView>, Batch)> = Vec::new();
        let column_name = |r: &FeatureRef| if request.full_feature_names { r.qualified() } else { r.field.clone() };

        for group in groups {
            match &group.target {
                Target::View(view) => {
                    let read = self.read_view(view, rows, &mut cache)?;
                    for feature_ref in &group.refs {
                        let mut column = FeatureColumn::new(column_name(feature_ref), feature_ref.clone(), rows.len());
                        for row in read {
                            match row {
                                Some(row) => {
                                    let value = row.values.get(&feature_ref.field).cloned().unwrap_or_default();
                                    let status = FieldStatus::of(&value);
                                    column.push(value, status, Some(row.event_ts));
                                }
                                None => column.push(Value::Null, FieldStatus::NotFound, None),
                            }
                        }
                        features.push(column);
                    }
                }
                Target::Odfv(odfv) => match self.compute_odfv(odfv, rows, &mut cache)? {
                    Ok(output) => {
                        for feature_ref in &group.refs {
                            let mut column = FeatureColumn::new(column_name(feature_ref), feature_ref.clone(), rows.len());
                            for value in output.require(&feature_ref.field)?.values() {
                                column.push(value.clone(), FieldStatus::of(value), Some(now));
                            }
                            features.push(column);
                        }
                        if odfv.is_persisted() {
                            computed.push((odfv.clone(), output));
                        }
                    }
                    Err(e) => {
                        debug!("On demand feature view {} failed: {}", odfv.name, e);
                        for feature_ref in &group.refs {
                            let mut column = FeatureColumn::new(column_name(feature_ref), feature_ref.clone(), rows.len());
                            for _ in rows {
                                column.push(Value::Null, FieldStatus::Failed, None);
                            }
                            features.push(column);
                            errors.insert(feature_ref.to_string(), e.clone());
                        }
                    }
                },
            }
        }

        let mut names = HashSet::new();
        for feature in &features {
            if !names.insert(feature.name.clone()) {
                return Err(FeatureStoreError::InvalidFeatureRef(format!(
                    "feature name '{}' is requested from several views, use full feature names",
                    feature.name
                )));
            }
        }
        entity_columns.retain(|c| !names.contains(c.name()));

        if persist == Persist::Async {
            self.submit_update(&computed, rows, now);
        }
        Ok(OnlineResponse { entity_columns, features, errors })
    }

    fn submit_update(&self, computed: &[(Arc<OnDemandFeatureView>, Batch)], rows: &[EntityRow], now: DateTime<Utc>) {
        if computed.is_empty() {
            return;
        }
        let Some(handle) = &self.persistence else {
            warn!("No persistence worker attached, skipping update of {} on demand feature views", computed.len());
            return;
        };
        let mut batch = Batch::new(rows.len());
        let mut feature_refs = Vec::new();
        for (odfv, output) in computed {
            for column in output.columns() {
                let feature_ref = FeatureRef::new(odfv.name.clone(), column.name());
                if let Err(e) = batch.push_column(Column::new(feature_ref.qualified(), column.values().to_vec())) {
                    warn!("Skipping update column {}: {}", feature_ref, e);
                    continue;
                }
                feature_refs.push(feature_ref);
            }
        }
        let job = UpdateJob { computed: batch, feature_refs, entity_rows: rows.to_vec(), computed_at: now };
        if let Err(e) = handle.submit(job) {
            warn!("Online store update dropped: {}", e);
        }
    }

    fn resolve_target(&self, name: &str) -> Result<Target, FeatureStoreError> {
        match self.registry.get_feature_view(name) {
            Ok(view) => Ok(Target::View(view)),
            Err(FeatureStoreError::NotFound { .. }) => match self.registry.get_on_demand_feature_view(name) {
                Ok(odfv) => Ok(Target::Odfv(odfv)),
                Err(FeatureStoreError::NotFound { .. }) => Err(FeatureStoreError::not_found("feature view", name)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    fn plan(&self, selection: &FeatureSelection) -> Result<Vec<Group>, FeatureStoreError> {
        let refs = match selection {
            FeatureSelection::Refs(refs) => refs.iter().map(|r| FeatureRef::parse(r)).collect::<Result<Vec<_>, _>>()?,
            FeatureSelection::Service(name) => {
                let service = self.registry.get_feature_service(name)?;
                let mut refs = Vec::new();
                for projection in &service.projections {
                    let fields = match &projection.features {
                        Some(fields) => fields.clone(),
                        None => self.resolve_target(&projection.view_name)?.feature_names(),
                    };
                    refs.extend(fields.into_iter().map(|f| FeatureRef::new(projection.view_name.clone(), f)));
                }
                refs
            }
        };

        let mut groups: Vec<Group> = Vec::new();
        let mut seen = HashSet::new();
        for feature_ref in refs {
            if !seen.insert(feature_ref.clone()) {
                continue;
            }
            let idx = match groups.iter().position(|g| g.target.name() == feature_ref.view) {
                Some(idx) => idx,
                None => {
                    let target = self.resolve_target(&feature_ref.view)?;
                    if let Target::View(view) = &target {
                        if !view.online {
                            return Err(FeatureStoreError::InvalidFeatureRef(format!("feature view '{}' is not served online", view.name)));
                        }
                    }
                    groups.push(Group { target, refs: Vec::new() });
                    groups.len() - 1
                }
            };
            if !groups[idx].target.has_feature(&feature_ref.field) {
                return Err(FeatureStoreError::not_found("feature", feature_ref.to_string()));
            }
            groups[idx].refs.push(feature_ref);
        }
        Ok(groups)
    }

    fn read_view<'c>(&self, view: &FeatureView, rows: &[EntityRow], cache: &'c mut ReadCache) -> Result<&'c [Option<OnlineRow>], FeatureStoreError> {
        if !cache.contains_key(&view.name) {
            let keys = entity_keys(&view.name, &view.join_key_specs(), rows)?;
            let read = self.online_store.read_batch(&TableRef::of(view), &keys)?;
            cache.insert(view.name.clone(), read);
        }
        Ok(cache.get(&view.name).map(Vec::as_slice).unwrap_or_default())
    }

    /// Outer error aborts the request, inner error fails only this view's references.
    fn compute_odfv(&self, odfv: &OnDemandFeatureView, rows: &[EntityRow], cache: &mut ReadCache) -> Result<Result<Batch, OdfvError>, FeatureStoreError> {
        let mut base = Batch::new(rows.len());
        for embedded in odfv.source_views() {
            let registered = match self.registry.get_feature_view(&embedded.name) {
                Ok(view) => Some(view),
                Err(FeatureStoreError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            };
            let view = registered.as_deref().unwrap_or(embedded);
            let read = self.read_view(view, rows, cache)?;
            for spec in view.join_key_specs() {
                if !base.contains(&spec.name) {
                    base.push_column(key_column(&spec, rows))?;
                }
            }
            for field in view.features() {
                if base.contains(&field.name) {
                    continue;
                }
                let values = read.iter().map(|r| r.as_ref().and_then(|r| r.values.get(&field.name)).cloned().unwrap_or_default()).collect();
                base.push_column(Column::new(field.name.clone(), values))?;
            }
        }

        let mut request = Batch::new(rows.len());
        for source in odfv.request_sources() {
            for field in source.schema.fields() {
                if request.contains(&field.name) || !rows.iter().any(|r| r.contains(&field.name)) {
                    continue;
                }
                let mut values = Vec::with_capacity(rows.len());
                for row in rows {
                    let raw = row.get(&field.name).cloned().unwrap_or_default();
                    match raw.cast(field.dtype, CastMode::Lenient) {
                        Some(value) => values.push(value),
                        None => {
                            return Ok(Err(OdfvError::SchemaValidation {
                                odfv: odfv.name.clone(),
                                reason: format!("request input '{}' value {} is not a valid {}", field.name, raw, field.dtype),
                            }))
                        }
                    }
                }
                request.push_column(Column::new(field.name.clone(), values))?;
            }
        }
        Ok(evaluate(odfv, &base, &request))
    }
}

fn entity_keys(view: &str, specs: &[JoinKey], rows: &[EntityRow]) -> Result<Vec<EntityKey>, FeatureStoreError> {
    rows.iter()
        .enumerate()
        .map(|(idx, row)| EntityKey::build(specs, |k| row.get(k)).map_err(|e| e.into_store_error(view, idx)))
        .collect()
}

fn key_column(spec: &JoinKey, rows: &[EntityRow]) -> Column {
    let values = rows
        .iter()
        .map(|row| match (row.get(&spec.name), spec.dtype) {
            (Some(value), Some(dtype)) => value.cast(dtype, CastMode::Lenient).unwrap_or_else(|| value.clone()),
            (Some(value), None) => value.clone(),
            (None, _) => Value::Null,
        })
        .collect();
    Column::new(spec.name.clone(), values)
}
