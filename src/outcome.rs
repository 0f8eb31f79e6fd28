//! The canonical result-table cell ([`Outcome`]) and the error taxonomy
//! that feeds it.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A type-erased value recovered from a source's result table. Callers
/// downcast it back to the concrete `Value` type of the source they loaded
/// from via [`Outcome::into_value`]/[`Outcome::value_ref`].
#[derive(Clone)]
pub struct AnyValue(Arc<dyn Any + Send + Sync>);

impl AnyValue {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        AnyValue(Arc::new(value))
    }

    pub fn downcast<T: Any + Send + Sync + Clone>(&self) -> Option<T> {
        self.0.downcast_ref::<T>().cloned()
    }
}

impl fmt::Debug for AnyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AnyValue(..)")
    }
}

/// One cell of a source's result table: `ok(value)`, `not_found`, or
/// `error(cause)`.
#[derive(Clone, Debug)]
pub enum Outcome {
    Ok(AnyValue),
    NotFound,
    Error(Arc<LoadError>),
}

impl Outcome {
    pub fn ok<T: Any + Send + Sync>(value: T) -> Self {
        Outcome::Ok(AnyValue::new(value))
    }

    pub fn error(error: LoadError) -> Self {
        Outcome::Error(Arc::new(error))
    }
}

/// Configuration errors raised by `Loader::new`/source builders when an
/// option is invalid. A *caller* error: surfaces immediately, never lives
/// in a result table.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("unrecognised option `{0}`")]
    UnknownOption(String),

    #[error("invalid value for option `{option}`: {reason}")]
    InvalidOption { option: String, reason: String },
}

/// Programming errors raised directly by `Loader` operations. Always
/// *caller* errors: they surface immediately, regardless of the configured
/// [`GetPolicy`](crate::GetPolicy).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoaderError {
    #[error("no source bound to name `{0}`")]
    UnknownSource(String),

    #[error("batch was never run for this key (load it and call `run` first)")]
    UnrunBatch,
}

/// *Batch* errors: these never escape a source's `run` directly. Instead
/// they're recorded as `Outcome::Error` in the
/// result table and only reach a caller through `Loader::get`, filtered by
/// the error-policy layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    /// Relational primary-key coercion from a caller-supplied item key
    /// failed (e.g. a non-numeric string for an integer id).
    #[error("could not coerce `{given}` into a primary key of type {expected}")]
    BadId { given: String, expected: &'static str },

    /// A `{one, ..}` column load or a "has one"-kind association matched
    /// more than one row.
    #[error("expected at most one result, found {found}")]
    MultipleResults { found: usize },

    /// A user-supplied `run_batch` override returned a result that didn't
    /// line up with the pending items it was given.
    #[error("run_batch returned {returned} outcomes for {expected} pending items")]
    ProtocolViolation { expected: usize, returned: usize },

    /// The underlying store (or KV callback) raised.
    #[error("backend error: {0}")]
    Backend(String),

    /// The per-batch deadline was exceeded.
    #[error("batch timed out")]
    Timeout,
}

/// The shape `Loader::get` returns its error half as. Unifies the two
/// *caller*-error cases with the one *batch*-error case that the error
/// policy lets through (see `GetPolicy`).
#[derive(Debug, Clone, thiserror::Error)]
pub enum GetError {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Batch(Arc<LoadError>),
}
