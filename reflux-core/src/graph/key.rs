//! Compute keys.
//!
//! A [`ComputeKey`] addresses one cache slot: the compute function's
//! identity plus its argument tuple, type-erased so entries of every
//! function can share one index.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Name of a compute function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(&'static str);

impl FunctionId {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Object-safe equality.
pub trait DynEq: Any {
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Argument tuple of a compute function.
///
/// Implemented for every `Hash + Eq + Debug + Send + Sync + 'static` type.
pub trait KeyArgs: DynHash + DynEq + fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + fmt::Debug + Send + Sync + 'static> KeyArgs for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

dyn_hash::hash_trait_object!(KeyArgs);

/// Identity of one memoized computation.
#[derive(Clone)]
pub struct ComputeKey {
    function: FunctionId,
    args: Arc<dyn KeyArgs>,
}

impl ComputeKey {
    pub fn new<A: KeyArgs + 'static>(function: FunctionId, args: A) -> Self {
        Self {
            function,
            args: Arc::new(args),
        }
    }

    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// The argument tuple, if it is an `A`.
    pub fn args<A: 'static>(&self) -> Option<&A> {
        self.args.as_any().downcast_ref()
    }
}

impl fmt::Debug for ComputeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:?}", self.function, self.args)
    }
}

impl fmt::Display for ComputeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Hash for ComputeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.function.hash(state);
        self.args.hash(state);
    }
}

impl PartialEq for ComputeKey {
    fn eq(&self, other: &Self) -> bool {
        self.function == other.function && self.args.dyn_eq(other.args.as_any())
    }
}

impl Eq for ComputeKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const GET_USER: FunctionId = FunctionId::new("get_user");
    const GET_POST: FunctionId = FunctionId::new("get_post");

    #[test]
    fn keys_compare_by_function_and_args() {
        let a = ComputeKey::new(GET_USER, (1u64,));
        let b = ComputeKey::new(GET_USER, (1u64,));
        let c = ComputeKey::new(GET_USER, (2u64,));
        let d = ComputeKey::new(GET_POST, (1u64,));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<_> = [a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn same_function_different_arg_types_differ() {
        let a = ComputeKey::new(GET_USER, 1u64);
        let b = ComputeKey::new(GET_USER, 1u32);
        assert_ne!(a, b);
    }

    #[test]
    fn args_downcast() {
        let key = ComputeKey::new(GET_USER, ("alice".to_string(), 3u8));
        assert_eq!(
            key.args::<(String, u8)>(),
            Some(&("alice".to_string(), 3u8))
        );
        assert!(key.args::<u64>().is_none());
        assert_eq!(format!("{key:?}"), "get_user(\"alice\", 3)");
    }
}
