use crate::batch::Batch;
use crate::debug;
use crate::error::FeatureStoreError;
use crate::model::{FeatureView, FileSource};
use crate::online_store::{WriteRow, WriteSummary};
use crate::retrieval::FeatureStore;
use crate::schema::EntityKey;
use crate::value::{CastMode, Value, ValueType};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

fn timestamp(push_source: &str, column: &str, value: &Value) -> Result<DateTime<Utc>, FeatureStoreError> {
    value
        .cast(ValueType::UnixTimestamp, CastMode::Lenient)
        .and_then(|v| v.as_timestamp())
        .ok_or_else(|| FeatureStoreError::push(push_source, format!("column '{}' value {} is not a timestamp", column, value)))
}

/// Converts a pushed batch into write rows for `view`.
///
/// The batch must carry the view's join keys, every feature and the batch source's timestamp
/// column; other columns are ignored. Values are converted to the declared field types.
pub fn rows_for_view(
    push_source: &str,
    view: &FeatureView,
    batch: &Batch,
    batch_source: &FileSource,
    now: DateTime<Utc>,
) -> Result<Vec<WriteRow>, FeatureStoreError> {
    let missing = |column: &str| FeatureStoreError::push(push_source, format!("column '{}' required by '{}' is missing", column, view.name));
    let event_column = batch.column(&batch_source.timestamp_field).ok_or_else(|| missing(&batch_source.timestamp_field))?;
    let created_column = match &batch_source.created_timestamp_column {
        Some(name) => batch.column(name),
        None => None,
    };
    let key_specs = view.join_key_specs();
    for spec in &key_specs {
        if !batch.contains(&spec.name) {
            return Err(missing(&spec.name));
        }
    }
    let features = view.features();
    let mut feature_columns = Vec::with_capacity(features.len());
    for field in &features {
        feature_columns.push((*field, batch.column(&field.name).ok_or_else(|| missing(&field.name))?));
    }

    let mut rows = Vec::with_capacity(batch.num_rows());
    for idx in 0..batch.num_rows() {
        let entity_key = EntityKey::build(&key_specs, |k| batch.column(k).map(|c| &c.values()[idx]))
            .map_err(|e| FeatureStoreError::push(push_source, format!("row {}: {}", idx, e)))?;
        let event_ts = timestamp(push_source, event_column.name(), &event_column.values()[idx])?;
        let created_ts = match created_column {
            Some(column) if !column.values()[idx].is_null() => timestamp(push_source, column.name(), &column.values()[idx])?,
            _ => now,
        };
        let mut values = BTreeMap::new();
        for (field, column) in &feature_columns {
            let raw = &column.values()[idx];
            let value = raw.cast(field.dtype, CastMode::Lenient).ok_or_else(|| {
                FeatureStoreError::push(push_source, format!("row {}: '{}' value {} is not a valid {}", idx, field.name, raw, field.dtype))
            })?;
            values.insert(field.name.clone(), value);
        }
        rows.push(WriteRow { entity_key, values, event_ts, created_ts });
    }
    Ok(rows)
}

impl FeatureStore {
    /// Writes `batch` into every online feature view fed by `push_source_name`.
    /// Event times come from each row's own timestamp column.
    pub fn push(&self, push_source_name: &str, batch: &Batch) -> Result<WriteSummary, FeatureStoreError> {
        let push_source = self.registry().get_push_source(push_source_name)?;
        let views: Vec<_> = self.registry().feature_views_for_push_source(push_source_name).into_iter().filter(|v| v.online).collect();
        if views.is_empty() {
            return Err(FeatureStoreError::push(push_source_name, "no online feature view reads from this push source"));
        }
        let now = self.now();
        let mut planned = Vec::with_capacity(views.len());
        for view in &views {
            planned.push((view, rows_for_view(push_source_name, view, batch, &push_source.batch_source, now)?));
        }
        let mut summary = WriteSummary::default();
        for (view, rows) in planned {
            let written = self.online_store().write_batch(&view.name, &rows)?;
            debug!("Pushed {} rows into {} ({} cells applied, {} dropped)", written.rows, view.name, written.applied_cells, written.dropped_cells);
            summary.absorb(written);
        }
        Ok(summary)
    }
}
