use std::collections::HashMap;
use std::future::Future;

use stratum_types::error::AdapterError;

/// Per-index outcome of one batch call.
pub type BatchResults<O> = HashMap<usize, Result<O, AdapterError>>;

/// The grouped remote call a [`BatchProcessor`](super::BatchProcessor) drives.
///
/// `process` receives the items in submission order and returns a map keyed
/// by index into that slice. An index missing from the map counts as a
/// failure for that item. Returning `Err` fails the whole batch; every item
/// then goes through the retry rule.
pub trait BatchHandler: Send + Sync + 'static {
    type Item: Send + Sync + 'static;
    type Output: Send + 'static;

    fn process(
        &self,
        items: &[Self::Item],
    ) -> impl Future<Output = Result<BatchResults<Self::Output>, AdapterError>> + Send;
}
