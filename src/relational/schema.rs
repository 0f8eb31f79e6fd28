//! Entity schemas, associations, and the field-value/params vocabulary
//! shared by primary-key, column, and association loads.

use std::collections::BTreeMap;
use std::fmt;

use uuid::Uuid;

use crate::outcome::LoadError;

/// A loosely-typed scalar: the common currency between caller-supplied item
/// keys, coerced primary keys, `params` option values, and values read off
/// a [`Record`](super::Record). Deliberately small -- this engine has no
/// query language of its own, so it only needs enough structure to compare
/// and coerce values, not to represent arbitrary SQL types.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum FieldValue {
    Int(i64),
    Uuid(Uuid),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Null,
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(n) => write!(f, "{n}"),
            FieldValue::Uuid(u) => write!(f, "{u}"),
            FieldValue::Str(s) => write!(f, "{s}"),
            FieldValue::Bytes(b) => write!(f, "{b:?}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Null => write!(f, "null"),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        FieldValue::Uuid(value)
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

/// The primary-key type an entity's schema declares. Drives the id
/// coercion step: a caller-supplied `FieldValue::Str` is only accepted if
/// it can be parsed into this type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdKind {
    Integer,
    Uuid,
    Binary,
}

impl IdKind {
    pub fn name(self) -> &'static str {
        match self {
            IdKind::Integer => "integer",
            IdKind::Uuid => "uuid",
            IdKind::Binary => "binary",
        }
    }

    /// Coerce a caller-supplied id into this entity's declared primary-key
    /// type. Values already of the right shape pass through unchanged;
    /// strings are parsed; anything else fails with `LoadError::BadId`.
    pub fn coerce(self, value: &FieldValue) -> Result<FieldValue, LoadError> {
        let bad_id = || LoadError::BadId {
            given: value.to_string(),
            expected: self.name(),
        };

        match (self, value) {
            (IdKind::Integer, FieldValue::Int(n)) => Ok(FieldValue::Int(*n)),
            (IdKind::Integer, FieldValue::Str(s)) => {
                s.parse::<i64>().map(FieldValue::Int).map_err(|_| bad_id())
            }
            (IdKind::Uuid, FieldValue::Uuid(u)) => Ok(FieldValue::Uuid(*u)),
            (IdKind::Uuid, FieldValue::Str(s)) => {
                Uuid::parse_str(s).map(FieldValue::Uuid).map_err(|_| bad_id())
            }
            (IdKind::Binary, FieldValue::Bytes(b)) => Ok(FieldValue::Bytes(b.clone())),
            (IdKind::Binary, FieldValue::Str(s)) => Ok(FieldValue::Bytes(s.clone().into_bytes())),
            _ => Err(bad_id()),
        }
    }
}

/// Whether a column or association load yields at most one row (`one`) or
/// an ordered sequence of rows (`many`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

/// A relation from one entity to another.
#[derive(Clone, Debug)]
pub struct Association {
    pub kind: AssociationKind,
    /// Column compared against the parent's identifying value. For
    /// `BelongsTo`/`HasOne`/`HasMany` this is the foreign-key column on the
    /// *target* entity's rows (see DESIGN.md for the belongs-to
    /// simplification). Unused for `ManyToMany` (bridging is entirely the
    /// caller's `run_batch` override's responsibility).
    pub foreign_key: &'static str,
    pub target_entity: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssociationKind {
    BelongsTo,
    HasOne,
    HasMany,
    ManyToMany { join_entity: &'static str },
}

impl AssociationKind {
    pub fn cardinality(self) -> Cardinality {
        match self {
            AssociationKind::BelongsTo | AssociationKind::HasOne => Cardinality::One,
            AssociationKind::HasMany | AssociationKind::ManyToMany { .. } => Cardinality::Many,
        }
    }
}

/// Describes one entity: its primary-key type and the associations the
/// engine may be asked to walk from it.
#[derive(Clone, Debug)]
pub struct EntitySchema {
    pub name: &'static str,
    pub primary_key: &'static str,
    pub id_kind: IdKind,
    pub associations: BTreeMap<&'static str, Association>,
}

impl EntitySchema {
    pub fn new(name: &'static str, primary_key: &'static str, id_kind: IdKind) -> Self {
        EntitySchema {
            name,
            primary_key,
            id_kind,
            associations: BTreeMap::new(),
        }
    }

    pub fn with_association(mut self, name: &'static str, association: Association) -> Self {
        self.associations.insert(name, association);
        self
    }
}

/// The `params` mapping merged from a source's `default_params` and any
/// per-call override. A `BTreeMap` gives batch keys a canonical,
/// order-independent identity for free -- two `Params` constructed with
/// the same entries in different orders compare equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Params(BTreeMap<String, FieldValue>);

impl Params {
    pub fn new() -> Self {
        Params(BTreeMap::new())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn limit(&self) -> Option<&FieldValue> {
        self.get("limit")
    }

    pub fn offset(&self) -> Option<&FieldValue> {
        self.get("offset")
    }

    /// Merge `override_params` on top of `self`, with `override_params`
    /// winning conflicts (`default_params` merged under the call-site
    /// `params`, caller wins).
    pub fn merged_with(&self, override_params: &Params) -> Params {
        let mut merged = self.0.clone();
        for (key, value) in &override_params.0 {
            merged.insert(key.clone(), value.clone());
        }
        Params(merged)
    }
}

/// Read-only access to a named field on an opaque result row. The engine
/// never constructs rows itself (that's the excluded SQL builder/ORM's
/// job) -- it only ever reads fields back off rows a [`Repo`](super::Repo)
/// returned, to partition them back to pending item keys.
pub trait Record: Clone + Send + Sync + 'static {
    fn field(&self, name: &str) -> Option<FieldValue>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_coercion_accepts_numeric_strings() {
        let coerced = IdKind::Integer.coerce(&FieldValue::from("42")).unwrap();
        assert_eq!(coerced, FieldValue::Int(42));
    }

    #[test]
    fn integer_coercion_rejects_non_numeric_strings() {
        let result = IdKind::Integer.coerce(&FieldValue::from("not-a-number"));
        assert!(matches!(result, Err(LoadError::BadId { .. })));
    }

    #[test]
    fn params_merge_lets_caller_win() {
        let defaults = Params::new().with("limit", 10i64);
        let overrides = Params::new().with("limit", 20i64);
        let merged = defaults.merged_with(&overrides);
        assert_eq!(merged.limit(), Some(&FieldValue::Int(20)));
    }

    #[test]
    fn params_identity_is_order_independent() {
        let a = Params::new().with("limit", 1i64).with("offset", 2i64);
        let b = Params::new().with("offset", 2i64).with("limit", 1i64);
        assert_eq!(a, b);
    }
}
