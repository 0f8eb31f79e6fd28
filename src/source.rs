//! The object-safe capability set any source (built-in or user-supplied)
//! must implement.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;

use crate::events::OutcomeCounts;
use crate::key::{BatchKey, ItemKey};
use crate::outcome::{LoadError, Outcome};

/// A pluggable backend adapter. `Loader` holds these behind `Arc<dyn
/// Source>`, one per bound name, and never inspects batch/item keys itself
/// -- it only carries them through to the named source unchanged.
///
/// `load`/`fetch`/`pending_batches` are non-suspending, O(1) amortised: they
/// only touch the source's own pending/result tables. `run` is the single
/// suspension point.
#[async_trait]
pub trait Source: Send + Sync {
    /// Record `item_key` as awaiting a load under `batch_key`. A no-op if
    /// `(batch_key, item_key)` already has a recorded outcome (invariant 3).
    fn load(&self, batch_key: BatchKey, item_key: ItemKey);

    /// Drain the pending table, dispatch, and append outcomes to the result
    /// table. Returns a tally for the `run.stop` event.
    ///
    /// `default_timeout`/`default_async` are the loader's own `timeout`/
    /// `async?` options; a source that wasn't given its own override falls
    /// back to these rather than hardcoding one.
    async fn run(&self, default_timeout: Duration, default_async: bool) -> OutcomeCounts;

    /// Pure lookup over the result table. `None` means the pair was never
    /// loaded, or was loaded after the most recent `run`.
    fn fetch(&self, batch_key: &BatchKey, item_key: &ItemKey) -> Option<Outcome>;

    /// Whether this source has any batch key with at least one pending item.
    fn pending_batches(&self) -> bool;

    /// This source's own per-batch timeout override, if one was set on its
    /// builder. `None` means it falls back to the loader's default.
    fn timeout(&self) -> Option<Duration>;

    /// This source's own `async?` override, if one was set on its builder.
    /// `None` means it falls back to the loader's default.
    fn is_async(&self) -> Option<bool>;
}

/// Runs one batch's dispatch `body` under a timeout and panic guard, giving
/// every source the same per-batch failure-isolation semantics: a panic or
/// timeout inside the dispatch is caught and converted to an outcome,
/// never escaping to abort the run.
pub(crate) async fn guarded_dispatch<T, F>(timeout: Duration, body: F) -> Result<T, LoadError>
where
    F: std::future::Future<Output = Result<T, LoadError>> + Send,
{
    let guarded = AssertUnwindSafe(body).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(error))) => Err(error),
        Ok(Err(panic)) => {
            let message = panic_message(&panic);
            Err(LoadError::Backend(message))
        }
        Err(_elapsed) => Err(LoadError::Timeout),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "batch dispatch panicked".to_string()
    }
}
