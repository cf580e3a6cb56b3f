//! A single fixed-size, open-addressed, robin-hood probed table.
//!
//! This is the "base functionality" the source generates per entry type via
//! `XHASHTIER_GEN`; here it is one generic type parameterized over the
//! entry payload `E`; callers provide the hash and equality test per call
//! instead of baking them into generated functions.
//!
//! Hash `0` is reserved to mean "empty slot" — every hash value we store
//! has its low bit forced to `1` (see [`mix`]) so a genuine zero hash never
//! collides with emptiness.

use crate::err::{Error, Result};

struct Slot<E> {
    hash: u64,
    entry: Option<E>,
}

impl<E> Slot<E> {
    const EMPTY: Slot<E> = Slot {
        hash: 0,
        entry: None,
    };

    fn is_empty(&self) -> bool {
        self.hash == 0
    }
}

/// Rounds `n` up to the nearest power of two, with a floor of 8.
pub fn tier_size(n: usize) -> usize {
    n.max(8).next_power_of_two()
}

/// The largest prime not greater than `n`. Used as the modulus for the
/// probe start function so that adversarial hash clustering at
/// power-of-two-aligned values doesn't all land on the same start index.
pub fn prime_below(n: usize) -> usize {
    if n <= 2 {
        return n.max(2);
    }
    let mut candidate = if n % 2 == 0 { n - 1 } else { n };
    loop {
        if is_prime(candidate) {
            return candidate;
        }
        candidate -= 2;
    }
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Ensures a raw hash never collides with the empty sentinel.
pub fn mix(h: u64) -> u64 {
    h | 1
}

/// One fixed-capacity robin-hood table.
pub struct HashTier<E> {
    slots: Vec<Slot<E>>,
    size: usize,
    modulus: usize,
    count: usize,
    /// Number of trailing slots (from the end) not yet migrated out during
    /// an incremental rehash. Equal to `size` for a freshly allocated tier
    /// that has nothing left to migrate out of it, and counts down to zero
    /// as `condense` drains it.
    pub(super) remap: usize,
}

impl<E> HashTier<E> {
    /// Allocates a new tier sized to hold at least `hint` entries.
    pub fn with_capacity(hint: usize) -> Self {
        let size = tier_size(hint);
        let mut slots = Vec::with_capacity(size);
        slots.resize_with(size, || Slot::EMPTY);
        HashTier {
            slots,
            size,
            modulus: prime_below(size),
            count: 0,
            remap: size,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    pub fn load(&self) -> f64 {
        self.count as f64 / self.size as f64
    }

    fn start(&self, hash: u64) -> usize {
        (hash as usize) % self.modulus
    }

    fn wrap(&self, idx: usize) -> usize {
        idx & (self.size - 1)
    }

    fn distance(&self, idx: usize, hash: u64) -> usize {
        self.wrap(idx + self.size - self.start(hash))
    }

    /// Looks up `hash`, calling `eq` on each same-hash candidate entry until
    /// it returns true. Returns the slot index on success.
    pub fn get(&self, hash: u64, mut eq: impl FnMut(&E) -> bool) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let hash = mix(hash);
        let mut idx = self.start(hash);
        let mut dist = 0usize;
        loop {
            let slot = &self.slots[idx];
            if slot.is_empty() || self.distance(idx, slot.hash) < dist {
                return None;
            }
            if slot.hash == hash && eq(slot.entry.as_ref().unwrap()) {
                return Some(idx);
            }
            idx = self.wrap(idx + 1);
            dist += 1;
        }
    }

    pub fn entry(&self, idx: usize) -> &E {
        self.slots[idx].entry.as_ref().unwrap()
    }

    pub fn entry_mut(&mut self, idx: usize) -> &mut E {
        self.slots[idx].entry.as_mut().unwrap()
    }

    /// Robin-hood insert. `eq` identifies an existing entry to update in
    /// place; `make` builds a fresh entry if none matched. Returns the slot
    /// index and whether an existing entry was replaced.
    ///
    /// Two phases: first walk the probe sequence the same way `get` does,
    /// stopping either at an existing match (update) or at the first slot
    /// whose resident is "richer" than us (the robin-hood insertion
    /// point). Second, place our entry there and shift every following
    /// resident forward by one slot until an empty slot absorbs the last
    /// of them — the textbook robin-hood insert-with-displacement.
    pub fn reserve(
        &mut self,
        hash: u64,
        mut eq: impl FnMut(&E) -> bool,
        make: impl FnOnce() -> E,
    ) -> Result<(usize, bool)> {
        if self.count == self.size {
            return Err(Error::Range);
        }
        let hash = mix(hash);
        let mut idx = self.start(hash);
        let mut dist = 0usize;
        loop {
            if self.slots[idx].is_empty() {
                break;
            }
            if self.slots[idx].hash == hash && eq(self.slots[idx].entry.as_ref().unwrap()) {
                self.slots[idx].entry = Some(make());
                return Ok((idx, true));
            }
            let resident_dist = self.distance(idx, self.slots[idx].hash);
            if resident_dist < dist {
                break;
            }
            idx = self.wrap(idx + 1);
            dist += 1;
        }

        let result_idx = idx;
        let mut carry_hash = hash;
        let mut carry_entry = make();
        loop {
            if self.slots[idx].is_empty() {
                self.slots[idx] = Slot {
                    hash: carry_hash,
                    entry: Some(carry_entry),
                };
                self.count += 1;
                break;
            }
            let resident = std::mem::replace(
                &mut self.slots[idx],
                Slot {
                    hash: carry_hash,
                    entry: Some(carry_entry),
                },
            );
            carry_hash = resident.hash;
            carry_entry = resident.entry.unwrap();
            idx = self.wrap(idx + 1);
        }
        Ok((result_idx, false))
    }

    /// Moves an entry into `self` via force-insert: robin-hood into empty
    /// slots only. Used during incremental rehash, where the destination
    /// tier is guaranteed not to already hold the key, so no match check
    /// is needed — only the insertion-point search and forward shift.
    pub fn force_insert(&mut self, hash: u64, entry: E) -> usize {
        let hash = mix(hash);
        let mut idx = self.start(hash);
        let mut dist = 0usize;
        loop {
            if self.slots[idx].is_empty() {
                break;
            }
            let resident_dist = self.distance(idx, self.slots[idx].hash);
            if resident_dist < dist {
                break;
            }
            idx = self.wrap(idx + 1);
            dist += 1;
        }

        let result_idx = idx;
        let mut carry_hash = hash;
        let mut carry_entry = entry;
        loop {
            if self.slots[idx].is_empty() {
                self.slots[idx] = Slot {
                    hash: carry_hash,
                    entry: Some(carry_entry),
                };
                self.count += 1;
                break;
            }
            let resident = std::mem::replace(
                &mut self.slots[idx],
                Slot {
                    hash: carry_hash,
                    entry: Some(carry_entry),
                },
            );
            carry_hash = resident.hash;
            carry_entry = resident.entry.unwrap();
            idx = self.wrap(idx + 1);
        }
        result_idx
    }

    /// Removes the entry at `idx` via back-shift deletion, returning it.
    pub fn remove(&mut self, idx: usize) -> Option<E> {
        if self.slots[idx].is_empty() {
            return None;
        }
        let removed = std::mem::replace(&mut self.slots[idx], Slot::EMPTY).entry;
        let mut hole = idx;
        loop {
            let next = self.wrap(hole + 1);
            if self.slots[next].is_empty() || self.distance(next, self.slots[next].hash) == 0 {
                break;
            }
            self.slots.swap(hole, next);
            hole = next;
        }
        self.count -= 1;
        removed
    }

    /// Drains up to `limit` non-empty slots from the watermark end into
    /// `dst`, marking them empty here. Returns the number migrated.
    pub fn condense(&mut self, dst: &mut HashTier<E>, limit: usize) -> usize {
        let mut migrated = 0;
        while migrated < limit && self.remap > 0 {
            let i = self.remap - 1;
            if !self.slots[i].is_empty() {
                let slot = std::mem::replace(&mut self.slots[i], Slot::EMPTY);
                dst.force_insert(slot.hash, slot.entry.unwrap());
                self.count -= 1;
                migrated += 1;
            }
            self.remap -= 1;
        }
        migrated
    }

    /// Iterates all occupied slots in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.slots.iter().filter_map(|s| s.entry.as_ref())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut E> {
        self.slots.iter_mut().filter_map(|s| s.entry.as_mut())
    }

    /// Walks every occupied slot and asserts the robin-hood invariant:
    /// no slot's probe distance may be less than one plus the distance a
    /// predecessor-chain slot would have if it were displaced past it.
    /// In practice this reduces to: for every slot, if the previous slot
    /// (by probe order) is occupied, its distance is not greater than
    /// ours by more than one step of wraparound slack — concretely we
    /// check the simpler, equivalent statement used by the source's
    /// tests: scanning forward from any occupied slot's ideal start, the
    /// distance sequence never "skips" an earlier claim, i.e. no occupied
    /// slot has a successor (before the next empty slot) with a *smaller*
    /// probe distance than it minus one.
    #[cfg(any(test, feature = "_internal_invariants"))]
    pub fn check_invariants(&self) {
        for i in 0..self.size {
            if self.slots[i].is_empty() {
                continue;
            }
            let d = self.distance(i, self.slots[i].hash);
            let next = self.wrap(i + 1);
            if !self.slots[next].is_empty() {
                let dn = self.distance(next, self.slots[next].hash);
                assert!(
                    dn + 1 >= d,
                    "robin-hood invariant violated at slot {i} (dist {d}) -> {next} (dist {dn})"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(k: u64) -> u64 {
        // cheap avalanche so sequential keys don't all collide on `start`.
        let mut x = k;
        x ^= x >> 33;
        x = x.wrapping_mul(0xff51afd7ed558ccd);
        x ^= x >> 33;
        x
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut t: HashTier<(u64, u64)> = HashTier::with_capacity(8);
        for k in 0..6u64 {
            t.reserve(h(k), |e| e.0 == k, || (k, k * 10)).unwrap();
        }
        t.check_invariants();
        for k in 0..6u64 {
            let idx = t.get(h(k), |e| e.0 == k).unwrap();
            assert_eq!(t.entry(idx).1, k * 10);
        }
    }

    #[test]
    fn update_replaces_value_without_growing_count() {
        let mut t: HashTier<(u64, u64)> = HashTier::with_capacity(8);
        t.reserve(h(1), |e| e.0 == 1, || (1, 100)).unwrap();
        let (_, was_update) = t.reserve(h(1), |e| e.0 == 1, || (1, 200)).unwrap();
        assert!(was_update);
        assert_eq!(t.len(), 1);
        let idx = t.get(h(1), |e| e.0 == 1).unwrap();
        assert_eq!(t.entry(idx).1, 200);
    }

    #[test]
    fn remove_then_get_returns_none() {
        let mut t: HashTier<(u64, u64)> = HashTier::with_capacity(8);
        for k in 0..6u64 {
            t.reserve(h(k), |e| e.0 == k, || (k, k)).unwrap();
        }
        let idx = t.get(h(3), |e| e.0 == 3).unwrap();
        t.remove(idx);
        t.check_invariants();
        assert!(t.get(h(3), |e| e.0 == 3).is_none());
        for k in [0, 1, 2, 4, 5] {
            assert!(t.get(h(k), |e| e.0 == k).is_some());
        }
    }

    #[test]
    fn prime_below_is_prime_and_not_larger() {
        for n in [8usize, 16, 32, 64, 128, 1024] {
            let p = prime_below(n);
            assert!(p <= n);
            assert!(is_prime(p));
        }
    }
}
