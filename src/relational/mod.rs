//! Loads entities by primary key, arbitrary column, or association. The
//! SQL builder / ORM integration itself is out of scope -- see [`Repo`]
//! for the minimal interface this source requires of one.

mod repo;
mod schema;

pub use repo::{Repo, RepoOpts};
pub use schema::{Association, AssociationKind, Cardinality, EntitySchema, FieldValue, IdKind, Params, Record};

use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chashmap::CHashMap;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};

use crate::events::OutcomeCounts;
use crate::key::{BatchKey, ItemKey};
use crate::outcome::{LoadError, Outcome};
use crate::source::{guarded_dispatch, Source};

/// The three batch-key shapes a relational load can take. Constructed
/// through [`primary_key_batch`], [`column_batch`], and
/// [`association_batch`] rather than built by hand.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RelKey {
    PrimaryKey {
        entity: &'static str,
        params: Params,
    },
    Column {
        cardinality: Cardinality,
        entity: &'static str,
        params: Params,
        column: &'static str,
    },
    Association {
        parent_entity: &'static str,
        association: &'static str,
        params: Params,
    },
}

/// A primary-key load batch key: `load(source, primary_key_batch(entity,
/// params), item_key(id))`.
pub fn primary_key_batch(entity: &'static str, params: Params) -> BatchKey {
    BatchKey::new(RelKey::PrimaryKey { entity, params })
}

/// A column load batch key.
pub fn column_batch(
    cardinality: Cardinality,
    entity: &'static str,
    params: Params,
    column: &'static str,
) -> BatchKey {
    BatchKey::new(RelKey::Column {
        cardinality,
        entity,
        params,
        column,
    })
}

/// An association load batch key.
pub fn association_batch(
    parent_entity: &'static str,
    association: &'static str,
    params: Params,
) -> BatchKey {
    BatchKey::new(RelKey::Association {
        parent_entity,
        association,
        params,
    })
}

/// An item key for any of the three relational load modes. Primary-key
/// loads use the raw (possibly string) id; column loads use the column
/// value; association loads use the parent's primary-key value (its
/// identity, which is what an association's item key is defined to be).
pub fn item_key(value: impl Into<FieldValue>) -> ItemKey {
    ItemKey::new(value.into())
}

type RunBatchFn<R> = Arc<
    dyn Fn(
            &'static str,
            <R as Repo>::Query,
            Option<&'static str>,
            Vec<FieldValue>,
            RepoOpts,
        ) -> BoxFuture<'static, Result<Vec<Outcome>, String>>
        + Send
        + Sync,
>;

/// A [`Source`] that loads entities out of a [`Repo`] by primary key,
/// column, or association, with each load mode batching and caching
/// independently.
pub struct RelationalSource<R: Repo> {
    label: Cow<'static, str>,
    repo: R,
    schemas: HashMap<&'static str, EntitySchema>,
    query_fn: Arc<dyn Fn(&'static str, &Params) -> R::Query + Send + Sync>,
    run_batch: Option<RunBatchFn<R>>,
    default_params: Params,
    repo_opts: RepoOpts,
    timeout: Option<Duration>,
    is_async: Option<bool>,
    pending: Mutex<HashMap<RelKey, HashSet<FieldValue>>>,
    results: CHashMap<(RelKey, FieldValue), Outcome>,
}

impl<R> RelationalSource<R>
where
    R: Repo + Send + Sync + 'static,
{
    pub fn build(repo: R, schemas: impl IntoIterator<Item = EntitySchema>) -> RelationalSourceBuilder<R> {
        let schemas = schemas.into_iter().map(|schema| (schema.name, schema)).collect();
        RelationalSourceBuilder {
            repo,
            schemas,
            query_fn: Arc::new(|_entity, _params| R::Query::default()),
            run_batch: None,
            default_params: Params::new(),
            repo_opts: RepoOpts::new(),
            timeout: None,
            is_async: None,
            label: "unlabeled-relational-source".into(),
        }
    }

    fn schema(&self, entity: &'static str) -> Result<&EntitySchema, LoadError> {
        self.schemas
            .get(entity)
            .ok_or_else(|| LoadError::Backend(format!("no schema registered for entity `{entity}`")))
    }

    fn fail_all(&self, rel_key: &RelKey, items: &[FieldValue], error: LoadError) -> OutcomeCounts {
        let error = Arc::new(error);
        for raw in items {
            self.results
                .insert((rel_key.clone(), raw.clone()), Outcome::Error(error.clone()));
        }
        OutcomeCounts {
            ok: 0,
            not_found: 0,
            error: items.len(),
        }
    }

    /// Execute `query` through the repo, guarded by `timeout` and panic
    /// isolation.
    async fn execute_default(&self, timeout: Duration, query: R::Query) -> Result<Vec<R::Row>, LoadError> {
        let repo_opts = self.repo_opts.clone();
        guarded_dispatch(timeout, async move {
            self.repo
                .execute(query, &repo_opts)
                .await
                .map_err(|error| LoadError::Backend(error.to_string()))
        })
        .await
    }

    /// Invoke the `run_batch` override, validating its protocol: one
    /// outcome per pending item, same order, or `ProtocolViolation`.
    async fn execute_override(
        &self,
        timeout: Duration,
        run_batch: &RunBatchFn<R>,
        entity: &'static str,
        base_query: R::Query,
        column: Option<&'static str>,
        items: Vec<FieldValue>,
    ) -> Result<Vec<Outcome>, LoadError> {
        let expected = items.len();
        let repo_opts = self.repo_opts.clone();
        let run_batch = run_batch.clone();
        let outcomes = guarded_dispatch(timeout, async move {
            run_batch(entity, base_query, column, items, repo_opts)
                .await
                .map_err(LoadError::Backend)
        })
        .await?;

        if outcomes.len() != expected {
            return Err(LoadError::ProtocolViolation {
                expected,
                returned: outcomes.len(),
            });
        }

        Ok(outcomes)
    }

    async fn dispatch(&self, timeout: Duration, rel_key: RelKey, items: HashSet<FieldValue>) -> OutcomeCounts {
        match rel_key {
            RelKey::PrimaryKey { entity, params } => {
                self.dispatch_primary_key(timeout, entity, params, items).await
            }
            RelKey::Column { cardinality, entity, params, column } => {
                self.dispatch_column(timeout, cardinality, entity, params, column, items).await
            }
            RelKey::Association { parent_entity, association, params } => {
                self.dispatch_association(timeout, parent_entity, association, params, items).await
            }
        }
    }

    async fn dispatch_primary_key(
        &self,
        timeout: Duration,
        entity: &'static str,
        params: Params,
        items: HashSet<FieldValue>,
    ) -> OutcomeCounts {
        let rel_key = RelKey::PrimaryKey { entity, params: params.clone() };
        let items: Vec<FieldValue> = items.into_iter().collect();

        let schema = match self.schema(entity) {
            Ok(schema) => schema,
            Err(error) => return self.fail_all(&rel_key, &items, error),
        };

        let mut counts = OutcomeCounts::default();
        let mut work = Vec::with_capacity(items.len());
        for raw in &items {
            match schema.id_kind.coerce(raw) {
                Ok(id) => work.push((raw.clone(), id)),
                Err(error) => {
                    self.results
                        .insert((rel_key.clone(), raw.clone()), Outcome::error(error));
                    counts.error += 1;
                }
            }
        }

        if work.is_empty() {
            return counts;
        }

        let merged_params = self.default_params.merged_with(&params);
        let base_query = (self.query_fn)(entity, &merged_params);
        let ids: Vec<FieldValue> = work.iter().map(|(_, id)| id.clone()).collect();
        let primary_key_field = schema.primary_key;

        let outcome_result = if let Some(run_batch) = &self.run_batch {
            self.execute_override(timeout, run_batch, entity, base_query, None, ids.clone())
                .await
        } else {
            let query = self.repo.with_id_in(base_query, &ids);
            self.execute_default(timeout, query).await.map(|rows| {
                ids.iter()
                    .map(|id| match_primary_key(&rows, primary_key_field, id))
                    .collect()
            })
        };

        match outcome_result {
            Ok(outcomes) => {
                for ((raw, _id), outcome) in work.into_iter().zip(outcomes) {
                    counts = counts.merge(tally(&outcome));
                    self.results.insert((rel_key.clone(), raw), outcome);
                }
            }
            Err(error) => {
                let raws: Vec<FieldValue> = work.into_iter().map(|(raw, _)| raw).collect();
                counts = counts.merge(self.fail_all(&rel_key, &raws, error));
            }
        }

        counts
    }

    async fn dispatch_column(
        &self,
        timeout: Duration,
        cardinality: Cardinality,
        entity: &'static str,
        params: Params,
        column: &'static str,
        items: HashSet<FieldValue>,
    ) -> OutcomeCounts {
        let rel_key = RelKey::Column { cardinality, entity, params: params.clone(), column };
        let items: Vec<FieldValue> = items.into_iter().collect();

        let merged_params = self.default_params.merged_with(&params);
        let base_query = (self.query_fn)(entity, &merged_params);

        let outcome_result = if let Some(run_batch) = &self.run_batch {
            self.execute_override(timeout, run_batch, entity, base_query, Some(column), items.clone())
                .await
        } else {
            let query = self.repo.with_column_in(base_query, column, &items);
            self.execute_default(timeout, query).await.map(|rows| {
                items
                    .iter()
                    .map(|value| match cardinality {
                        Cardinality::One => match_single(&rows, column, value),
                        Cardinality::Many => match_many(&rows, column, value),
                    })
                    .collect()
            })
        };

        self.write_results(&rel_key, items, outcome_result)
    }

    async fn dispatch_association(
        &self,
        timeout: Duration,
        parent_entity: &'static str,
        association: &'static str,
        params: Params,
        items: HashSet<FieldValue>,
    ) -> OutcomeCounts {
        let rel_key = RelKey::Association { parent_entity, association, params: params.clone() };
        let items: Vec<FieldValue> = items.into_iter().collect();

        let parent_schema = match self.schema(parent_entity) {
            Ok(schema) => schema,
            Err(error) => return self.fail_all(&rel_key, &items, error),
        };
        let assoc = match parent_schema.associations.get(association) {
            Some(assoc) => assoc.clone(),
            None => {
                let error = LoadError::Backend(format!(
                    "entity `{parent_entity}` has no association `{association}`"
                ));
                return self.fail_all(&rel_key, &items, error);
            }
        };

        if matches!(assoc.kind, AssociationKind::ManyToMany { .. }) && self.run_batch.is_none() {
            let error = LoadError::Backend(
                "many-to-many associations require a `run_batch` override to build the bridging query"
                    .to_string(),
            );
            return self.fail_all(&rel_key, &items, error);
        }

        let merged_params = self.default_params.merged_with(&params);
        let base_query = (self.query_fn)(assoc.target_entity, &merged_params);
        let cardinality = assoc.kind.cardinality();
        let foreign_key = assoc.foreign_key;

        let outcome_result = if let Some(run_batch) = &self.run_batch {
            self.execute_override(
                timeout,
                run_batch,
                assoc.target_entity,
                base_query,
                Some(foreign_key),
                items.clone(),
            )
            .await
        } else {
            let query = self.repo.with_foreign_key_in(base_query, foreign_key, &items);
            self.execute_default(timeout, query).await.map(|rows| {
                items
                    .iter()
                    .map(|parent_id| match cardinality {
                        Cardinality::One => match_single(&rows, foreign_key, parent_id),
                        Cardinality::Many => match_many(&rows, foreign_key, parent_id),
                    })
                    .collect()
            })
        };

        self.write_results(&rel_key, items, outcome_result)
    }

    fn write_results(
        &self,
        rel_key: &RelKey,
        items: Vec<FieldValue>,
        outcome_result: Result<Vec<Outcome>, LoadError>,
    ) -> OutcomeCounts {
        match outcome_result {
            Ok(outcomes) => {
                let mut counts = OutcomeCounts::default();
                for (raw, outcome) in items.into_iter().zip(outcomes) {
                    counts = counts.merge(tally(&outcome));
                    self.results.insert((rel_key.clone(), raw), outcome);
                }
                counts
            }
            Err(error) => self.fail_all(rel_key, &items, error),
        }
    }
}

fn tally(outcome: &Outcome) -> OutcomeCounts {
    match outcome {
        Outcome::Ok(_) => OutcomeCounts { ok: 1, not_found: 0, error: 0 },
        Outcome::NotFound => OutcomeCounts { ok: 0, not_found: 1, error: 0 },
        Outcome::Error(_) => OutcomeCounts { ok: 0, not_found: 0, error: 1 },
    }
}

/// Cardinality rule for single-valued results: missing is `not_found`,
/// exactly one match is `ok(row)`, more than one is `multiple results`.
fn match_single<Row: Record>(rows: &[Row], field: &str, needle: &FieldValue) -> Outcome {
    let matches: Vec<&Row> = rows.iter().filter(|row| row.field(field).as_ref() == Some(needle)).collect();
    match matches.len() {
        0 => Outcome::NotFound,
        1 => Outcome::ok(matches[0].clone()),
        found => Outcome::error(LoadError::MultipleResults { found }),
    }
}

/// Primary keys are assumed unique by definition, so unlike `match_single`
/// this never raises `MultipleResults`: if a `Repo::with_id_in` impl
/// somehow returns more than one row for an id, the first match wins.
fn match_primary_key<Row: Record>(rows: &[Row], field: &str, needle: &FieldValue) -> Outcome {
    match rows.iter().find(|row| row.field(field).as_ref() == Some(needle)) {
        Some(row) => Outcome::ok(row.clone()),
        None => Outcome::NotFound,
    }
}

/// Multi-valued results always yield `ok(list)`, possibly empty, in
/// whatever order the query returned: the engine does not reorder.
fn match_many<Row: Record>(rows: &[Row], field: &str, needle: &FieldValue) -> Outcome {
    let matched: Vec<Row> = rows
        .iter()
        .filter(|row| row.field(field).as_ref() == Some(needle))
        .cloned()
        .collect();
    Outcome::ok(matched)
}

#[async_trait]
impl<R> Source for RelationalSource<R>
where
    R: Repo + Send + Sync + 'static,
{
    fn load(&self, batch_key: BatchKey, item_key: ItemKey) {
        let rel_key = batch_key
            .downcast_ref::<RelKey>()
            .expect("RelationalSource::load: batch key type mismatch")
            .clone();
        let value = item_key
            .downcast_ref::<FieldValue>()
            .expect("RelationalSource::load: item key type mismatch")
            .clone();

        if self.results.contains_key(&(rel_key.clone(), value.clone())) {
            return;
        }

        let mut pending = self.pending.lock().unwrap();
        pending.entry(rel_key).or_default().insert(value);
    }

    async fn run(&self, default_timeout: Duration, default_async: bool) -> OutcomeCounts {
        let pending = {
            let mut guard = self.pending.lock().unwrap();
            std::mem::take(&mut *guard)
        };

        if pending.is_empty() {
            tracing::trace!(relational_source = %self.label, "run called with no pending batches");
            return OutcomeCounts::default();
        }

        let timeout = self.timeout.unwrap_or(default_timeout);
        let concurrency = if self.is_async.unwrap_or(default_async) {
            pending.len().max(1)
        } else {
            1
        };

        stream::iter(pending.into_iter())
            .map(|(rel_key, items)| self.dispatch(timeout, rel_key, items))
            .buffer_unordered(concurrency)
            .fold(OutcomeCounts::default(), |acc, counts| async move { acc.merge(counts) })
            .await
    }

    fn fetch(&self, batch_key: &BatchKey, item_key: &ItemKey) -> Option<Outcome> {
        let rel_key = batch_key.downcast_ref::<RelKey>()?;
        let value = item_key.downcast_ref::<FieldValue>()?;
        self.results.get(&(rel_key.clone(), value.clone())).map(|guard| guard.clone())
    }

    fn pending_batches(&self) -> bool {
        let pending = self.pending.lock().unwrap();
        pending.values().any(|items| !items.is_empty())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn is_async(&self) -> Option<bool> {
        self.is_async
    }
}

/// Used to configure a new [`RelationalSource`]. Returned from
/// [`RelationalSource::build`].
pub struct RelationalSourceBuilder<R: Repo> {
    repo: R,
    schemas: HashMap<&'static str, EntitySchema>,
    query_fn: Arc<dyn Fn(&'static str, &Params) -> R::Query + Send + Sync>,
    run_batch: Option<RunBatchFn<R>>,
    default_params: Params,
    repo_opts: RepoOpts,
    timeout: Option<Duration>,
    is_async: Option<bool>,
    label: Cow<'static, str>,
}

impl<R> RelationalSourceBuilder<R>
where
    R: Repo + Send + Sync + 'static,
{
    /// Last-mile query customisation hook: `(entity, merged_params) ->
    /// base_query`. Defaults to `R::Query::default()`.
    pub fn query(mut self, query_fn: impl Fn(&'static str, &Params) -> R::Query + Send + Sync + 'static) -> Self {
        self.query_fn = Arc::new(query_fn);
        self
    }

    /// Override the default batch dispatch. Must return one outcome per
    /// pending item, in the same order it was given them; a mismatch
    /// surfaces as `LoadError::ProtocolViolation`.
    pub fn run_batch<F, Fut>(mut self, run_batch: F) -> Self
    where
        F: Fn(&'static str, R::Query, Option<&'static str>, Vec<FieldValue>, RepoOpts) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: std::future::Future<Output = Result<Vec<Outcome>, String>> + Send + 'static,
    {
        self.run_batch = Some(Arc::new(move |entity, query, column, items, opts| {
            Box::pin(run_batch(entity, query, column, items, opts))
        }));
        self
    }

    pub fn default_params(mut self, default_params: Params) -> Self {
        self.default_params = default_params;
        self
    }

    pub fn repo_opts(mut self, repo_opts: RepoOpts) -> Self {
        self.repo_opts = repo_opts;
        self
    }

    /// Falls back to the loader's own `timeout` option if left unset.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Falls back to the loader's own `async?` option if left unset.
    pub fn async_(mut self, is_async: bool) -> Self {
        self.is_async = Some(is_async);
        self
    }

    pub fn label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = label.into();
        self
    }

    pub fn finish(self) -> RelationalSource<R> {
        RelationalSource {
            label: self.label,
            repo: self.repo,
            schemas: self.schemas,
            query_fn: self.query_fn,
            run_batch: self.run_batch,
            default_params: self.default_params,
            repo_opts: self.repo_opts,
            timeout: self.timeout,
            is_async: self.is_async,
            pending: Mutex::new(HashMap::new()),
            results: CHashMap::new(),
        }
    }
}
