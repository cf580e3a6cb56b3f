//! Drives a rehash cycle across the tiered hash map and checks that every
//! surviving key still resolves correctly afterward.

use taskhub::hash::HashMap;

#[test]
fn rehash_cycle_preserves_surviving_keys() {
    let mut map: HashMap<i32, i32> = HashMap::with_capacity(4);

    for k in 1..=20i32 {
        map.insert(k, k * 10);
    }
    assert_eq!(map.len(), 20);
    for k in 1..=20i32 {
        assert_eq!(map.get(&k), Some(&(k * 10)));
    }

    for k in 1..=13i32 {
        map.remove(&k);
    }
    for k in 21..=23i32 {
        map.insert(k, k * 10);
    }

    assert_eq!(map.len(), 10);
    for k in 1..=13i32 {
        assert_eq!(map.get(&k), None);
    }
    for k in 14..=23i32 {
        assert_eq!(map.get(&k), Some(&(k * 10)));
    }
}
