//! Tiered, incrementally-rehashing robin-hood hash map.
//!
//! A [`HashMap`] holds one or two [`tier::HashTier`]s. Tier 0 is always the
//! live tier that inserts land in; tier 1, when present, is the tier being
//! drained after a resize. Every subsequent operation performs a bounded
//! amount of migration work against tier 1 so no single call pays for the
//! whole rehash.

pub mod tier;

use std::hash::{Hash, Hasher};
use std::collections::hash_map::DefaultHasher;

use crate::config::HASH_LOAD_FACTOR;
use tier::HashTier;

/// Bounded amount of tier-1 migration work performed per public operation.
const CONDENSE_STEP: usize = 4;

struct Entry<K, V> {
    key: K,
    value: V,
}

fn hash_of<K: Hash>(key: &K) -> u64 {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish()
}

/// A generic map built on the tiered robin-hood engine described in the
/// component design: used directly here, and as the backing store for the
/// HTTP header map and the DNS cache.
pub struct HashMap<K, V> {
    live: HashTier<Entry<K, V>>,
    old: Option<HashTier<Entry<K, V>>>,
}

impl<K: Hash + Eq, V> HashMap<K, V> {
    /// Creates a map with room for at least `hint` entries before the
    /// first rehash.
    pub fn with_capacity(hint: usize) -> Self {
        HashMap {
            live: HashTier::with_capacity(hint),
            old: None,
        }
    }

    /// Number of live entries across all tiers.
    pub fn len(&self) -> usize {
        self.live.len() + self.old.as_ref().map_or(0, |t| t.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Performs bounded migration work against the draining tier, if any.
    fn condense(&mut self) {
        if let Some(old) = self.old.as_mut() {
            old.condense(&mut self.live, CONDENSE_STEP);
            if old.is_empty() {
                self.old = None;
            }
        }
    }

    fn maybe_rehash(&mut self) {
        if self.old.is_some() {
            return;
        }
        if self.live.load() > HASH_LOAD_FACTOR {
            let new_size = self.live.capacity() * 2;
            let old = std::mem::replace(&mut self.live, HashTier::with_capacity(new_size));
            log::trace!(
                "hash map rehash: {} -> {} slots, {} live entries",
                old.capacity(),
                new_size,
                old.len()
            );
            self.old = Some(old);
        }
    }

    /// Looks up `key`, probing the live tier first and the draining tier
    /// second. A hit in the draining tier is opportunistically promoted
    /// into the live tier when the live tier has room to spare.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.condense();
        let h = hash_of(key);
        if let Some(idx) = self.live.get(h, |e| &e.key == key) {
            return Some(&self.live.entry(idx).value);
        }
        if let Some(old) = self.old.as_mut() {
            if let Some(idx) = old.get(h, |e| &e.key == key) {
                if self.live.load() < HASH_LOAD_FACTOR {
                    if let Some(entry) = old.remove(idx) {
                        let (new_idx, _) = self
                            .live
                            .reserve(h, |e| &e.key == key, || entry)
                            .expect("live tier sized to accept promoted entry");
                        if old.is_empty() {
                            self.old = None;
                        }
                        return Some(&self.live.entry(new_idx).value);
                    }
                }
                return Some(&old.entry(idx).value);
            }
        }
        None
    }

    /// Inserts or updates `key`, always landing in the live tier. Returns
    /// the previous value, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V>
    where
        K: Clone,
    {
        self.condense();
        self.maybe_rehash();
        let h = hash_of(&key);

        // If the key currently lives in the draining tier, lift it out
        // first so the abstract map never holds it in two tiers at once.
        let mut previous = None;
        if let Some(old) = self.old.as_mut() {
            if let Some(idx) = old.get(h, |e| e.key == key) {
                previous = old.remove(idx).map(|e| e.value);
                if old.is_empty() {
                    self.old = None;
                }
            }
        }

        if let Some(idx) = self.live.get(h, |e| e.key == key) {
            previous = Some(std::mem::replace(&mut self.live.entry_mut(idx).value, value));
            return previous;
        }

        let key_for_match = key.clone();
        self.live
            .reserve(h, |e| e.key == key_for_match, move || Entry { key, value })
            .expect("live tier has capacity: maybe_rehash runs before every insert");
        previous
    }

    /// Removes `key`, searching the live tier then the draining tier.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.condense();
        let h = hash_of(key);
        if let Some(idx) = self.live.get(h, |e| &e.key == key) {
            return self.live.remove(idx).map(|e| e.value);
        }
        if let Some(old) = self.old.as_mut() {
            if let Some(idx) = old.get(h, |e| &e.key == key) {
                let removed = old.remove(idx).map(|e| e.value);
                if old.is_empty() {
                    self.old = None;
                }
                return removed;
            }
        }
        None
    }

    pub fn contains_key(&mut self, key: &K) -> bool {
        // `get` takes `&mut self` for opportunistic promotion; callers that
        // only want a boolean still go through it to keep tier bookkeeping
        // in one place.
        self.get(key).is_some()
    }

    /// Iterates every live entry across both tiers, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        let old_iter = self.old.iter().flat_map(|t| t.iter());
        self.live
            .iter()
            .chain(old_iter)
            .map(|e| (&e.key, &e.value))
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        self.live.check_invariants();
        if let Some(old) = &self.old {
            old.check_invariants();
        }
    }
}

impl<K: Hash + Eq, V> Default for HashMap<K, V> {
    fn default() -> Self {
        HashMap::with_capacity(8)
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8, u16),
        Remove(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), any::<u16>()).prop_map(|(k, v)| Op::Insert(k, v)),
            any::<u8>().prop_map(Op::Remove),
        ]
    }

    proptest! {
        /// Replays the same insert/remove sequence against this map and
        /// against `std::collections::HashMap`, and checks they agree after
        /// every operation. `u8` keys keep the key space small enough that
        /// collisions and rehashes both happen often within a short run.
        #[test]
        fn matches_std_hash_map(ops in prop::collection::vec(op_strategy(), 0..200)) {
            let mut mine: HashMap<u8, u16> = HashMap::with_capacity(4);
            let mut model: std::collections::HashMap<u8, u16> = std::collections::HashMap::new();

            for op in ops {
                match op {
                    Op::Insert(k, v) => {
                        prop_assert_eq!(mine.insert(k, v), model.insert(k, v));
                    }
                    Op::Remove(k) => {
                        prop_assert_eq!(mine.remove(&k), model.remove(&k));
                    }
                }
            }

            prop_assert_eq!(mine.len(), model.len());
            for (k, v) in &model {
                prop_assert_eq!(mine.get(k), Some(v));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_round_trip() {
        let mut m: HashMap<u64, u64> = HashMap::with_capacity(8);
        for k in 0..20u64 {
            m.insert(k, k * 2);
        }
        for k in 0..20u64 {
            assert_eq!(m.get(&k), Some(&(k * 2)));
        }
        for k in 0..10u64 {
            m.remove(&k);
        }
        for k in 0..10u64 {
            assert_eq!(m.get(&k), None);
        }
        for k in 10..20u64 {
            assert_eq!(m.get(&k), Some(&(k * 2)));
        }
        assert_eq!(m.len(), 10);
    }

    #[test]
    fn rehash_preserves_all_entries_without_duplication() {
        let mut m: HashMap<u64, u64> = HashMap::with_capacity(4);
        for k in 1..=20u64 {
            m.insert(k, k);
            m.check_invariants();
        }
        assert_eq!(m.len(), 20);
        for k in 1..=20u64 {
            assert_eq!(m.get(&k), Some(&k));
        }

        for k in 1..13u64 {
            m.remove(&k);
        }
        for k in 21..=23u64 {
            m.insert(k, k);
        }

        for k in 1..13u64 {
            assert_eq!(m.get(&k), None);
        }
        for k in 14..=23u64 {
            assert_eq!(m.get(&k), Some(&k));
        }
    }

    #[test]
    fn update_replaces_value_and_returns_old() {
        let mut m: HashMap<u64, u64> = HashMap::with_capacity(8);
        assert_eq!(m.insert(1, 10), None);
        assert_eq!(m.insert(1, 20), Some(10));
        assert_eq!(m.get(&1), Some(&20));
        assert_eq!(m.len(), 1);
    }
}
