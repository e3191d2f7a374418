use crate::batch::Batch;
use std::error::Error;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// User code computing an on demand feature view's output from its inputs.
///
/// Implementations must be pure: same input batch, same output batch.
pub trait Transform: Send + Sync {
    fn transform(&self, inputs: &Batch) -> Result<Batch, BoxError>;
}

impl<F> Transform for F
where
    F: Fn(&Batch) -> Result<Batch, BoxError> + Send + Sync,
{
    fn transform(&self, inputs: &Batch) -> Result<Batch, BoxError> {
        self(inputs)
    }
}
