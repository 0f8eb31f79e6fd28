//! The minimal interface the engine requires of a relational store handle.
//! The SQL builder / ORM integration itself is explicitly out of scope --
//! callers provide their own `Repo` impl wrapping whatever query layer
//! they actually use.

use std::fmt::Display;

use async_trait::async_trait;

use super::schema::{FieldValue, Record};
use crate::relational::Params;

/// Opaque options forwarded unchanged to every store call.
pub type RepoOpts = Params;

/// A handle to the underlying data store, plus the few predicate-building
/// operations the default batch dispatch needs to turn a base query into a
/// batched one. Implementors own the actual query language (SQL, a
/// document query, whatever `Query` is).
#[async_trait]
pub trait Repo: Send + Sync {
    type Query: Send + Clone + Default;
    type Row: Record;
    type Error: Display + Send + Sync + 'static;

    /// Run `query` against the store and return every matching row.
    async fn execute(
        &self,
        query: Self::Query,
        repo_opts: &RepoOpts,
    ) -> Result<Vec<Self::Row>, Self::Error>;

    /// Layer an `id IN (..)` predicate onto `query` for a primary-key load.
    fn with_id_in(&self, query: Self::Query, ids: &[FieldValue]) -> Self::Query;

    /// Layer a `column IN (..)` predicate onto `query` for a column load.
    fn with_column_in(&self, query: Self::Query, column: &str, values: &[FieldValue]) -> Self::Query;

    /// Layer a foreign-key `IN (..)` predicate onto `query` for an
    /// association load.
    fn with_foreign_key_in(
        &self,
        query: Self::Query,
        foreign_key: &str,
        parent_ids: &[FieldValue],
    ) -> Self::Query;
}
