//! Type-erased, value-equal identities for batch and item keys.
//!
//! A [`Loader`](crate::Loader) holds sources of different concrete key/value
//! types behind a single non-generic API, so batch keys and item keys have
//! to cross that boundary as a hashable, comparable, but otherwise opaque
//! value. `Key` is the object-safe capability that makes this possible; the
//! blanket impl means any ordinary `Eq + Hash + Debug` type can be used as a
//! batch or item key without implementing anything by hand.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Bound required of anything used as a batch key or item key.
pub trait KeyBound: Any + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn KeyBound) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
}

impl<T> KeyBound for T
where
    T: Any + Eq + Hash + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn KeyBound) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        // `T::hash` only requires `H: Hasher`, and `&mut dyn Hasher`
        // implements `Hasher` via the stdlib blanket impl, so this is a
        // plain (non-generic) dynamic dispatch.
        T::hash(self, &mut state)
    }
}

#[derive(Clone)]
struct AnyKey(Arc<dyn KeyBound>);

impl AnyKey {
    fn new<T: KeyBound>(value: T) -> Self {
        AnyKey(Arc::new(value))
    }

    fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }
}

impl PartialEq for AnyKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(&*other.0)
    }
}

impl Eq for AnyKey {}

impl Hash for AnyKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state)
    }
}

impl fmt::Debug for AnyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

macro_rules! any_key_newtype {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, PartialEq, Eq, Hash)]
        pub struct $name(AnyKey);

        impl $name {
            /// Wrap any hashable, debuggable, value-equal type as a key.
            pub fn new<T: KeyBound>(value: T) -> Self {
                $name(AnyKey::new(value))
            }

            /// Recover the concrete type this key was constructed from, if
            /// it matches `T`. Sources call this to interpret a key that
            /// the coordinator carried through unchanged.
            pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
                self.0.downcast_ref()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.0, f)
            }
        }
    };
}

// Deliberately no generic `impl<T: KeyBound> From<T> for BatchKey`: since
// `BatchKey`/`ItemKey` themselves satisfy `KeyBound`, such an impl would
// conflict with the stdlib's reflexive `impl<T> From<T> for T` the moment
// someone passed an already-built key through. Callers go through `::new`
// explicitly instead.

any_key_newtype!(
    BatchKey,
    "Identifies *what kind of load* an item belongs to. Two batch keys \
     coalesce into the same pending batch iff they are value-equal."
);
any_key_newtype!(
    ItemKey,
    "Identifies one datum within a batch."
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_values_coalesce() {
        let a = BatchKey::new(("users", 1u32));
        let b = BatchKey::new(("users", 1u32));
        let c = BatchKey::new(("users", 2u32));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn different_concrete_types_never_equal() {
        let a = BatchKey::new(1u32);
        let b = BatchKey::new(1i64);
        assert_ne!(a, b);
    }

    #[test]
    fn downcast_recovers_the_original_value() {
        let key = ItemKey::new(String::from("explode"));
        assert_eq!(key.downcast_ref::<String>().unwrap(), "explode");
        assert!(key.downcast_ref::<u32>().is_none());
    }

    #[test]
    fn hash_is_consistent_with_eq() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(BatchKey::new("comments"));
        assert!(set.contains(&BatchKey::new("comments")));
    }
}
