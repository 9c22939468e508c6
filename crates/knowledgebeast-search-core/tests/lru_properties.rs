//! Property tests for the bounded LRU cache.

use knowledgebeast_search_core::LruCache;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Put(u8, u16),
    Get(u8),
    Delete(u8),
    Clear,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), any::<u16>()).prop_map(|(k, v)| Op::Put(k, v)),
        any::<u8>().prop_map(Op::Get),
        any::<u8>().prop_map(Op::Delete),
        Just(Op::Clear),
    ]
}

proptest! {
    /// Size never exceeds capacity at any observation point, for any
    /// operation sequence.
    #[test]
    fn size_is_always_bounded_by_capacity(
        capacity in 1usize..32,
        ops in proptest::collection::vec(op_strategy(), 0..200),
    ) {
        let cache = LruCache::new(capacity).unwrap();
        for op in ops {
            match op {
                Op::Put(k, v) => cache.put(k, v),
                Op::Get(k) => { let _ = cache.get(&k); }
                Op::Delete(k) => { let _ = cache.delete(&k); }
                Op::Clear => cache.clear(),
            }
            prop_assert!(cache.len() <= capacity);
            let stats = cache.stats();
            prop_assert!(stats.size <= stats.capacity);
        }
    }

    /// A freshly inserted key is observable until evicted or deleted, and a
    /// hit always returns the last value written for that key.
    #[test]
    fn last_write_wins_for_live_keys(
        capacity in 4usize..16,
        writes in proptest::collection::vec((any::<u8>(), any::<u16>()), 1..64),
    ) {
        let cache = LruCache::new(capacity).unwrap();
        for (k, v) in &writes {
            cache.put(*k, *v);
            // The key just written is by definition the most recently used,
            // so it can never have been the eviction victim.
            prop_assert_eq!(cache.peek(k), Some(*v));
        }
    }
}
