//! Batch and cache potentially expensive data lookups within the scope of
//! a single request. The main motivation for this library is to solve the
//! "N + 1" query problem seen in GraphQL and elsewhere; it takes heavy
//! influence from the GraphQL Foundation's [DataLoader](https://github.com/graphql/dataloader)
//! and its various ports.
//!
//! The entrypoint is [`Loader`]: bind named [`Source`]s to it (a
//! [`KvSource`](kv::KvSource) for an arbitrary callback, a
//! [`RelationalSource`](relational::RelationalSource) for a
//! [`Repo`](relational::Repo)-backed store, or your own [`Source`] impl),
//! queue reads with [`Loader::load`]/[`Loader::load_many`], dispatch them
//! all at once with [`Loader::run`], then read results back with
//! [`Loader::get`]/[`Loader::get_many`].

pub(crate) mod events;
pub(crate) mod key;
pub(crate) mod kv;
pub(crate) mod loader;
pub(crate) mod outcome;
pub(crate) mod relational;
pub(crate) mod source;

pub use events::{Event, EventSink, OutcomeCounts, Subscriber};
pub use key::{BatchKey, ItemKey, KeyBound};
pub use kv::{KvSource, KvSourceBuilder};
pub use loader::{GetPolicy, Loader, LoaderOptions};
pub use outcome::{AnyValue, ConfigError, GetError, LoadError, LoaderError, Outcome};
pub use relational::{
    association_batch, column_batch, item_key, primary_key_batch, Association, AssociationKind, Cardinality,
    EntitySchema, FieldValue, IdKind, Params, RelKey, RelationalSource, RelationalSourceBuilder, Record, Repo,
    RepoOpts,
};
pub use source::Source;
