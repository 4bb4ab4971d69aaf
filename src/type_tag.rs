//! Process-wide type identity tokens.
//!
//! Every native type gets one [`TypeTag`] the first time it is asked for,
//! assigned from a monotonically increasing counter. Tags are never reused.

use std::any::TypeId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};

use rustc_hash::FxHashMap;
use sqrew_vm::TypeTag;

static TAGS: OnceLock<Mutex<FxHashMap<TypeId, TypeTag>>> = OnceLock::new();
static NEXT_TAG: AtomicU64 = AtomicU64::new(1);

/// The tag for `T`, allocating one on first use.
pub fn type_tag_of<T: 'static>() -> TypeTag {
    let tags = TAGS.get_or_init(|| Mutex::new(FxHashMap::default()));
    let mut tags = tags.lock().unwrap_or_else(PoisonError::into_inner);
    *tags
        .entry(TypeId::of::<T>())
        .or_insert_with(|| TypeTag(NEXT_TAG.fetch_add(1, Ordering::Relaxed)))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    #[test]
    fn tag_is_stable_per_type() {
        assert_eq!(type_tag_of::<Alpha>(), type_tag_of::<Alpha>());
    }

    #[test]
    fn distinct_types_get_distinct_tags() {
        assert_ne!(type_tag_of::<Alpha>(), type_tag_of::<Beta>());
        assert_ne!(type_tag_of::<u8>(), type_tag_of::<i8>());
    }

    #[test]
    fn tags_are_never_zero() {
        assert_ne!(type_tag_of::<Alpha>(), TypeTag(0));
    }
}
