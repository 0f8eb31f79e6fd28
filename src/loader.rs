//! The coordinator: binds named [`Source`]s together, fans `run` out across
//! them, and exposes the typed `get`/`get_many` read surface.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::events::{Event, EventSink, Subscriber};
use crate::key::{BatchKey, ItemKey};
use crate::outcome::{GetError, LoaderError, Outcome};
use crate::source::Source;

/// How `get`/`get_many` should treat a batch error recorded in a source's
/// result table. `RaiseOnError` and `Tuples` both propagate
/// the error as `Err`; there is no separate exception channel in Rust for
/// `Tuples` to use instead, so the two collapse to the same runtime
/// behaviour (see DESIGN.md's Open Question decisions). `ReturnNilOnError`
/// is the one policy that actually changes behaviour: it swallows the error
/// into `Ok(None)`, logging each failing pair once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetPolicy {
    RaiseOnError,
    ReturnNilOnError,
    Tuples,
}

impl Default for GetPolicy {
    fn default() -> Self {
        GetPolicy::RaiseOnError
    }
}

/// Options accepted by [`Loader::new`]. `timeout`/`async_` are `None` by
/// default and resolve to the loader's own defaults (15s, true) at
/// construction time; a source only consults them when its own builder
/// didn't set an override.
pub struct LoaderOptions {
    get_policy: GetPolicy,
    subscribers: Vec<Subscriber>,
    max_concurrent_sources: usize,
    timeout: Option<Duration>,
    async_: Option<bool>,
}

impl LoaderOptions {
    pub fn new() -> Self {
        LoaderOptions {
            get_policy: GetPolicy::default(),
            subscribers: Vec::new(),
            max_concurrent_sources: default_max_concurrent_sources(),
            timeout: None,
            async_: None,
        }
    }

    pub fn get_policy(mut self, get_policy: GetPolicy) -> Self {
        self.get_policy = get_policy;
        self
    }

    /// Register a subscriber for `run.start`/`run.stop`/`run.exception`
    /// events.
    pub fn subscribe(mut self, subscriber: Subscriber) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    /// Maximum number of sources dispatched concurrently during `run`.
    pub fn max_concurrent_sources(mut self, max: usize) -> Self {
        self.max_concurrent_sources = max;
        self
    }

    /// Default per-batch timeout for any source that didn't set its own.
    /// Defaults to 15 seconds.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Default `async?` for any source that didn't set its own. Defaults
    /// to `true`.
    pub fn async_(mut self, async_: bool) -> Self {
        self.async_ = Some(async_);
        self
    }
}

impl Default for LoaderOptions {
    fn default() -> Self {
        LoaderOptions::new()
    }
}

fn default_max_concurrent_sources() -> usize {
    std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(4)
}

/// Binds named sources and coordinates batched loading across them.
/// Construct with [`Loader::new`], register sources with
/// [`Loader::add_source`], then `load`/`run`/`get` in the usual
/// DataLoader-style request cycle: queue everything you need with `load`,
/// call `run` once, then read results back with `get`.
///
/// `Loader` is not `Clone`; it is meant to be created fresh per request and
/// dropped at the end of it.
pub struct Loader {
    sources: HashMap<Cow<'static, str>, Arc<dyn Source>>,
    get_policy: GetPolicy,
    events: EventSink,
    max_concurrent_sources: usize,
    default_timeout: Duration,
    default_async: bool,
    logged_once: Mutex<std::collections::HashSet<(Cow<'static, str>, BatchKey, ItemKey)>>,
}

impl Loader {
    pub fn new(options: LoaderOptions) -> Self {
        Loader {
            sources: HashMap::new(),
            get_policy: options.get_policy,
            events: EventSink::new(options.subscribers),
            max_concurrent_sources: options.max_concurrent_sources,
            default_timeout: options.timeout.unwrap_or(Duration::from_secs(15)),
            default_async: options.async_.unwrap_or(true),
            logged_once: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Bind `source` under `name`. Idempotent replace: if `name` is already
    /// bound, the old source is dropped and the next `run` dispatches
    /// against the new one.
    pub fn add_source(&mut self, name: impl Into<Cow<'static, str>>, source: impl Source + 'static) -> &mut Self {
        self.sources.insert(name.into(), Arc::new(source));
        self
    }

    fn source(&self, name: &str) -> Result<&Arc<dyn Source>, LoaderError> {
        self.sources
            .get(name)
            .ok_or_else(|| LoaderError::UnknownSource(name.to_string()))
    }

    /// Queue `item_key` as awaiting a load under `batch_key` on the named
    /// source. Non-suspending: the actual dispatch happens on the next
    /// [`Loader::run`].
    pub fn load(
        &self,
        source_name: &str,
        batch_key: BatchKey,
        item_key: ItemKey,
    ) -> Result<(), LoaderError> {
        let source = self.source(source_name)?;
        source.load(batch_key, item_key);
        Ok(())
    }

    /// [`Loader::load`] for many item keys under the same batch key.
    pub fn load_many(
        &self,
        source_name: &str,
        batch_key: BatchKey,
        item_keys: impl IntoIterator<Item = ItemKey>,
    ) -> Result<(), LoaderError> {
        let source = self.source(source_name)?;
        for item_key in item_keys {
            source.load(batch_key.clone(), item_key);
        }
        Ok(())
    }

    /// Whether any bound source has pending work.
    pub fn pending_batches(&self) -> bool {
        self.sources.values().any(|source| source.pending_batches())
    }

    /// Dispatch every source with pending work, concurrently, bounded by
    /// `max_concurrent_sources`. A source whose `run` panics or errors
    /// internally never aborts the others; its failure is reported via
    /// `Event::RunException` and its own `OutcomeCounts` simply isn't
    /// counted, since its pending items are left recorded as whatever its
    /// own guarded dispatch produced (see `Source::run`'s contract --
    /// sources never let dispatch panics escape `run` itself).
    ///
    /// `RunException` fires for two distinct kinds of source exception: a
    /// per-batch failure caught inside `Source::run` (the common case -- a
    /// backend error, a callback panic, a timeout, each already isolated to
    /// its own batch and counted in `OutcomeCounts`) and the rarer case of
    /// the task driving that source panicking at the Rust runtime level
    /// before it could even produce a tally.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) {
        let pending: Vec<(Cow<'static, str>, Arc<dyn Source>)> = self
            .sources
            .iter()
            .filter(|(_, source)| source.pending_batches())
            .map(|(name, source)| (name.clone(), source.clone()))
            .collect();

        if pending.is_empty() {
            tracing::trace!("run called with no pending batches across any source");
            return;
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_sources.max(1)));
        let mut tasks = JoinSet::new();

        for (name, source) in pending {
            let semaphore = semaphore.clone();
            let events = self.events.clone();
            let default_timeout = self.default_timeout;
            let default_async = self.default_async;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                events.emit(Event::RunStart { source_name: name.clone() });
                let started = Instant::now();
                let counts = source.run(default_timeout, default_async).await;
                if counts.error > 0 {
                    events.emit(Event::RunException {
                        source_name: name.clone(),
                        cause: format!("{} of {} pending items failed", counts.error, counts.ok + counts.not_found + counts.error),
                    });
                }
                events.emit(Event::RunStop {
                    source_name: name,
                    duration: started.elapsed(),
                    outcome_counts: counts,
                });
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(join_error) = joined {
                tracing::error!(error = %join_error, "a source's run task panicked");
                self.events.emit(Event::RunException {
                    source_name: "<unknown>".into(),
                    cause: join_error.to_string(),
                });
            }
        }
    }

    /// Read back the result of a previously-queued load, applying the
    /// configured [`GetPolicy`]. Returns `Err(LoaderError::UnrunBatch)` if
    /// the pair was never loaded, or was loaded but `run` hasn't dispatched
    /// it yet.
    pub async fn get<V>(
        &self,
        source_name: &str,
        batch_key: BatchKey,
        item_key: ItemKey,
    ) -> Result<Option<V>, GetError>
    where
        V: std::any::Any + Send + Sync + Clone,
    {
        let source = self.source(source_name).map_err(GetError::from)?;

        let outcome = source
            .fetch(&batch_key, &item_key)
            .ok_or_else(|| GetError::from(LoaderError::UnrunBatch))?;

        self.resolve(source_name, &batch_key, &item_key, outcome)
    }

    /// [`Loader::get`] for many item keys under the same batch key, in the
    /// same order they were given.
    pub async fn get_many<V>(
        &self,
        source_name: &str,
        batch_key: BatchKey,
        item_keys: impl IntoIterator<Item = ItemKey>,
    ) -> Result<Vec<Option<V>>, GetError>
    where
        V: std::any::Any + Send + Sync + Clone,
    {
        let source = self.source(source_name).map_err(GetError::from)?;

        let mut results = Vec::new();
        for item_key in item_keys {
            let outcome = source
                .fetch(&batch_key, &item_key)
                .ok_or_else(|| GetError::from(LoaderError::UnrunBatch))?;
            results.push(self.resolve(source_name, &batch_key, &item_key, outcome)?);
        }

        Ok(results)
    }

    fn resolve<V>(
        &self,
        source_name: &str,
        batch_key: &BatchKey,
        item_key: &ItemKey,
        outcome: Outcome,
    ) -> Result<Option<V>, GetError>
    where
        V: std::any::Any + Send + Sync + Clone,
    {
        match outcome {
            Outcome::Ok(value) => Ok(Some(value.downcast::<V>().unwrap_or_else(|| {
                panic!(
                    "Loader::get: `{source_name}` resolved `{batch_key:?}`/`{item_key:?}` to a value of a \
                     different type than `{}` -- this is a caller bug, not a missing result",
                    std::any::type_name::<V>(),
                )
            }))),
            Outcome::NotFound => Ok(None),
            Outcome::Error(cause) => match self.get_policy {
                GetPolicy::RaiseOnError | GetPolicy::Tuples => Err(GetError::Batch(cause)),
                GetPolicy::ReturnNilOnError => {
                    self.log_once(source_name, batch_key, item_key, &cause);
                    Ok(None)
                }
            },
        }
    }

    fn log_once(
        &self,
        source_name: &str,
        batch_key: &BatchKey,
        item_key: &ItemKey,
        cause: &crate::outcome::LoadError,
    ) {
        let marker = (Cow::Owned(source_name.to_string()), batch_key.clone(), item_key.clone());
        let mut logged = self.logged_once.lock().unwrap();
        if logged.insert(marker) {
            tracing::warn!(
                source = source_name,
                batch_key = ?batch_key,
                item_key = ?item_key,
                error = %cause,
                "swallowing batch error under return_nil_on_error policy",
            );
        }
    }
}
