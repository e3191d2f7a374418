use crate::batch::{Batch, Column};
use crate::error::OdfvError;
use crate::model::OnDemandFeatureView;
use crate::value::CastMode;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Computes the declared output of `odfv` for one batch of rows.
///
/// `base` holds join keys and materialized source features, `request` the request time inputs.
/// The returned batch has exactly the declared schema: columns in declared order, each value
/// of the declared type, undeclared transform output dropped.
pub fn evaluate(odfv: &OnDemandFeatureView, base: &Batch, request: &Batch) -> Result<Batch, OdfvError> {
    for column in odfv.required_inputs() {
        if !base.contains(&column) && !request.contains(&column) {
            return Err(OdfvError::MissingFeature { odfv: odfv.name.clone(), column });
        }
    }
    let inputs = base.merge_columns(request).map_err(|e| OdfvError::SchemaValidation { odfv: odfv.name.clone(), reason: e.to_string() })?;

    let output = match panic::catch_unwind(AssertUnwindSafe(|| odfv.transform.transform(&inputs))) {
        Ok(Ok(batch)) => batch,
        Ok(Err(e)) => return Err(OdfvError::TransformExecution { odfv: odfv.name.clone(), message: e.to_string() }),
        Err(payload) => return Err(OdfvError::TransformExecution { odfv: odfv.name.clone(), message: panic_message(payload) }),
    };
    conform(odfv, &output, inputs.num_rows())
}

fn conform(odfv: &OnDemandFeatureView, output: &Batch, num_rows: usize) -> Result<Batch, OdfvError> {
    let schema_error = |reason: String| OdfvError::SchemaValidation { odfv: odfv.name.clone(), reason };
    if output.num_rows() != num_rows {
        return Err(schema_error(format!("transform returned {} rows for {} input rows", output.num_rows(), num_rows)));
    }
    let mut conformed = Batch::new(num_rows);
    for field in odfv.schema.fields() {
        let column = output.column(&field.name).ok_or_else(|| schema_error(format!("declared column '{}' is missing", field.name)))?;
        let mut values = Vec::with_capacity(column.len());
        for value in column.values() {
            let cast = value.cast(field.dtype, CastMode::Strict).ok_or_else(|| {
                let actual = value.value_type().map(|t| t.to_string()).unwrap_or_else(|| "null".to_string());
                schema_error(format!("column '{}' expected {} but got {}", field.name, field.dtype, actual))
            })?;
            values.push(cast);
        }
        conformed.push_column(Column::new(field.name.clone(), values)).map_err(|e| schema_error(e.to_string()))?;
    }
    Ok(conformed)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(msg) => *msg,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(msg) => msg.to_string(),
            Err(_) => "transform panicked".to_string(),
        },
    }
}
