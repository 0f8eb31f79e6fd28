//! Wraps an arbitrary user callback as a [`Source`].

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chashmap::CHashMap;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};

use crate::events::OutcomeCounts;
use crate::key::{BatchKey, ItemKey, KeyBound};
use crate::outcome::{LoadError, Outcome};
use crate::source::{guarded_dispatch, Source};

type FetchFn<Tag, K, V, E> =
    Arc<dyn Fn(Tag, HashSet<K>) -> BoxFuture<'static, Result<HashMap<K, V>, E>> + Send + Sync>;

/// A [`Source`] backed by a single user-supplied callback
/// `fetch(batch_key, item_keys) -> mapping(item_key -> value)`.
///
/// On `run`, every pending batch key is dispatched to the callback once,
/// with the full set of item keys pending under it. Item keys present in
/// the returned mapping resolve `Ok`; item keys absent from it resolve
/// `NotFound`. A callback error (or panic, or timeout) resolves every item
/// in that batch to the same `Error` outcome.
pub struct KvSource<Tag, K, V, E = anyhow::Error>
where
    Tag: KeyBound + Clone + Eq + Hash,
    K: KeyBound + Clone + Eq + Hash,
    V: Send + Sync + Clone + 'static,
    E: Display + Send + Sync + 'static,
{
    label: Cow<'static, str>,
    callback: FetchFn<Tag, K, V, E>,
    pending: Mutex<HashMap<Tag, HashSet<K>>>,
    results: CHashMap<(Tag, K), Outcome>,
    max_concurrency: usize,
    timeout: Option<Duration>,
    is_async: Option<bool>,
}

impl<Tag, K, V, E> KvSource<Tag, K, V, E>
where
    Tag: KeyBound + Clone + Eq + Hash,
    K: KeyBound + Clone + Eq + Hash,
    V: Send + Sync + Clone + 'static,
    E: Display + Send + Sync + 'static,
{
    /// Start building a `KvSource` around `callback`. Call `.finish()` on
    /// the returned builder to create the source.
    pub fn build<F, Fut>(callback: F) -> KvSourceBuilder<Tag, K, V, E>
    where
        F: Fn(Tag, HashSet<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HashMap<K, V>, E>> + Send + 'static,
    {
        let callback: FetchFn<Tag, K, V, E> = Arc::new(move |tag, keys| Box::pin(callback(tag, keys)));
        KvSourceBuilder {
            callback,
            max_concurrency: default_max_concurrency(),
            timeout: None,
            is_async: None,
            label: "unlabeled-kv-source".into(),
        }
    }

    async fn dispatch_batch(&self, timeout: Duration, tag: Tag, keys: HashSet<K>) -> OutcomeCounts {
        let keys_vec: Vec<K> = keys.iter().cloned().collect();
        let callback = self.callback.clone();
        let dispatch_tag = tag.clone();

        let dispatched: Result<HashMap<K, V>, LoadError> = guarded_dispatch(timeout, async move {
            callback(dispatch_tag, keys)
                .await
                .map_err(|error| LoadError::Backend(error.to_string()))
        })
        .await;

        let mut counts = OutcomeCounts::default();
        match dispatched {
            Ok(returned) => {
                for key in keys_vec {
                    match returned.get(&key) {
                        Some(value) => {
                            self.results
                                .insert((tag.clone(), key), Outcome::ok(value.clone()));
                            counts.ok += 1;
                        }
                        None => {
                            self.results.insert((tag.clone(), key), Outcome::NotFound);
                            counts.not_found += 1;
                        }
                    }
                }
            }
            Err(error) => {
                let error = Arc::new(error);
                for key in keys_vec {
                    self.results
                        .insert((tag.clone(), key), Outcome::Error(error.clone()));
                    counts.error += 1;
                }
            }
        }

        counts
    }
}

#[async_trait]
impl<Tag, K, V, E> Source for KvSource<Tag, K, V, E>
where
    Tag: KeyBound + Clone + Eq + Hash,
    K: KeyBound + Clone + Eq + Hash,
    V: Send + Sync + Clone + 'static,
    E: Display + Send + Sync + 'static,
{
    fn load(&self, batch_key: BatchKey, item_key: ItemKey) {
        let tag = batch_key
            .downcast_ref::<Tag>()
            .expect("KvSource::load: batch key type mismatch")
            .clone();
        let key = item_key
            .downcast_ref::<K>()
            .expect("KvSource::load: item key type mismatch")
            .clone();

        if self.results.contains_key(&(tag.clone(), key.clone())) {
            // Already resolved; invariant 3 makes this a no-op.
            return;
        }

        let mut pending = self.pending.lock().unwrap();
        pending.entry(tag).or_default().insert(key);
    }

    async fn run(&self, default_timeout: Duration, default_async: bool) -> OutcomeCounts {
        let pending = {
            let mut guard = self.pending.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        if pending.is_empty() {
            tracing::trace!(kv_source = %self.label, "run called with no pending batches");
            return OutcomeCounts::default();
        }

        tracing::debug!(
            kv_source = %self.label,
            num_batches = pending.len(),
            "dispatching pending batches",
        );

        let timeout = self.timeout.unwrap_or(default_timeout);
        let concurrency = if self.is_async.unwrap_or(default_async) {
            self.max_concurrency.max(1)
        } else {
            1
        };

        stream::iter(pending.into_iter())
            .map(|(tag, keys)| self.dispatch_batch(timeout, tag, keys))
            .buffer_unordered(concurrency)
            .fold(OutcomeCounts::default(), |acc, counts| async move { acc.merge(counts) })
            .await
    }

    fn fetch(&self, batch_key: &BatchKey, item_key: &ItemKey) -> Option<Outcome> {
        let tag = batch_key.downcast_ref::<Tag>()?;
        let key = item_key.downcast_ref::<K>()?;
        self.results.get(&(tag.clone(), key.clone())).map(|guard| guard.clone())
    }

    fn pending_batches(&self) -> bool {
        let pending = self.pending.lock().unwrap();
        pending.values().any(|keys| !keys.is_empty())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn is_async(&self) -> Option<bool> {
        self.is_async
    }
}

/// Used to configure a new [`KvSource`]. Returned from [`KvSource::build`].
pub struct KvSourceBuilder<Tag, K, V, E = anyhow::Error>
where
    Tag: KeyBound + Clone + Eq + Hash,
    K: KeyBound + Clone + Eq + Hash,
    V: Send + Sync + Clone + 'static,
    E: Display + Send + Sync + 'static,
{
    callback: FetchFn<Tag, K, V, E>,
    max_concurrency: usize,
    timeout: Option<Duration>,
    is_async: Option<bool>,
    label: Cow<'static, str>,
}

impl<Tag, K, V, E> KvSourceBuilder<Tag, K, V, E>
where
    Tag: KeyBound + Clone + Eq + Hash,
    K: KeyBound + Clone + Eq + Hash,
    V: Send + Sync + Clone + 'static,
    E: Display + Send + Sync + 'static,
{
    /// Maximum number of batch keys dispatched to the callback concurrently
    /// during a single `run`. Defaults to 2x the number of logical CPUs.
    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Per-batch deadline; a batch that doesn't finish in time resolves
    /// every pending item in it to `Outcome::Error(LoadError::Timeout)`.
    /// Falls back to the loader's own `timeout` option if left unset.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// When `false`, batches dispatch sequentially on the calling task
    /// during `run` instead of concurrently. Falls back to the loader's
    /// own `async?` option if left unset.
    pub fn async_(mut self, is_async: bool) -> Self {
        self.is_async = Some(is_async);
        self
    }

    /// Set a label for this source, used only in diagnostics/tracing.
    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = label.into();
        self
    }

    /// Create the `KvSource` with the given options.
    pub fn finish(self) -> KvSource<Tag, K, V, E> {
        KvSource {
            label: self.label,
            callback: self.callback,
            pending: Mutex::new(HashMap::new()),
            results: CHashMap::new(),
            max_concurrency: self.max_concurrency,
            timeout: self.timeout,
            is_async: self.is_async,
        }
    }
}

fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
}
