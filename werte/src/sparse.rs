use crate::error::RuntimeError;

/// Keys for [`SparseMap`]: small integers hashed by identity, the policy the
/// variable-index maps rely on.
pub trait SparseKey: Copy + Eq {
    fn hash_index(self) -> u32;
}

impl SparseKey for i32 {
    #[inline(always)]
    fn hash_index(self) -> u32 {
        self as u32
    }
}

impl SparseKey for u32 {
    #[inline(always)]
    fn hash_index(self) -> u32 {
        self
    }
}

/// Initial index mask (capacity 4).
pub const DEFAULT_MASK: u32 = 3;

/// Growth ceiling; crossing it is a [`RuntimeError::CapacityExceeded`].
pub const MAX_CAPACITY: usize = 1 << 30;

struct MapEntry<K, V> {
    value: V,
    key: K,
    hash: u32,
}

/// Open-addressed map from small integer keys to value slots, used for
/// per-object variable storage when the variable set is sparse.
///
/// Bucket selection: `ideal_position(h) = mask & h & 0x7fff_ffff` — the mask
/// is a power of two minus one, and the AND with `i32::MAX` clips hashes to
/// the non-negative range. Collisions probe linearly; removal backward-shifts
/// every displaced follower, so probe chains never contain holes and lookups
/// stay deterministic and order-independent.
pub struct SparseMap<K, V> {
    entries: Vec<Option<MapEntry<K, V>>>,
    mask: u32,
    used: usize,
    grow_threshold: usize,
}

impl<K: SparseKey, V> Default for SparseMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for SparseMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pairs = self.entries.iter().flatten().map(|e| (&e.key, &e.value));
        f.debug_map().entries(pairs).finish()
    }
}

impl<K: SparseKey, V> SparseMap<K, V> {
    pub fn new() -> Self {
        Self::with_mask(DEFAULT_MASK)
    }

    /// `mask` must be a power of two minus one.
    pub fn with_mask(mask: u32) -> Self {
        let capacity = mask as usize + 1;
        debug_assert!(capacity.is_power_of_two(), "mask must be 2^n - 1");
        let mut entries = Vec::new();
        entries.resize_with(capacity, || None);
        Self {
            entries,
            mask,
            used: 0,
            grow_threshold: capacity * 3 / 4,
        }
    }

    /// The bucket a hash ideally lands in.
    #[inline(always)]
    pub fn ideal_position(&self, hash: u32) -> usize {
        (self.mask & hash & 0x7fff_ffff) as usize
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.used
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    #[inline(always)]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    #[inline(always)]
    pub fn grow_threshold(&self) -> usize {
        self.grow_threshold
    }

    /// Insert or replace. Returns the previous value for the key, if any.
    /// Grows (re-hashing every live element under the new mask) once the
    /// used count crosses the grow threshold.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, RuntimeError> {
        if self.used + 1 > self.grow_threshold {
            self.grow()?;
        }
        let hash = key.hash_index();
        let mask = self.mask as usize;
        let mut pos = self.ideal_position(hash);
        loop {
            match &mut self.entries[pos] {
                Some(entry) if entry.key == key => {
                    let old = std::mem::replace(&mut entry.value, value);
                    return Ok(Some(old));
                }
                Some(_) => pos = (pos + 1) & mask,
                slot @ None => {
                    *slot = Some(MapEntry { value, key, hash });
                    self.used += 1;
                    return Ok(None);
                }
            }
        }
    }

    pub fn get(&self, key: K) -> Option<&V> {
        let mask = self.mask as usize;
        let mut pos = self.ideal_position(key.hash_index());
        loop {
            match &self.entries[pos] {
                Some(entry) if entry.key == key => return Some(&entry.value),
                Some(_) => pos = (pos + 1) & mask,
                None => return None,
            }
        }
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let mask = self.mask as usize;
        let mut pos = self.ideal_position(key.hash_index());
        loop {
            match &self.entries[pos] {
                Some(entry) if entry.key == key => break,
                Some(_) => pos = (pos + 1) & mask,
                None => return None,
            }
        }
        self.entries[pos].as_mut().map(|entry| &mut entry.value)
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    /// Remove a key, backward-shifting displaced followers so the probe
    /// chain for every surviving key stays intact.
    pub fn remove(&mut self, key: K) -> Option<V> {
        let mask = self.mask as usize;
        let mut pos = self.ideal_position(key.hash_index());
        loop {
            match &self.entries[pos] {
                Some(entry) if entry.key == key => break,
                Some(_) => pos = (pos + 1) & mask,
                None => return None,
            }
        }

        let removed = self.entries[pos].take()?;
        self.used -= 1;

        // Backward shift: pull each follower into the hole while doing so
        // does not move it before its ideal bucket.
        let mut hole = pos;
        let mut probe = (hole + 1) & mask;
        while let Some(entry) = &self.entries[probe] {
            let ideal = self.ideal_position(entry.hash);
            let displacement = probe.wrapping_sub(ideal) & mask;
            let hole_distance = probe.wrapping_sub(hole) & mask;
            if displacement >= hole_distance {
                let moved = self.entries[probe].take();
                self.entries[hole] = moved;
                hole = probe;
            }
            probe = (probe + 1) & mask;
        }

        Some(removed.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .flatten()
            .map(|entry| (&entry.key, &entry.value))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.iter().flatten().map(|entry| &entry.value)
    }

    /// Consume the map, yielding every live `(key, value)` pair. The free
    /// path uses this to stage slot teardown.
    pub fn into_entries(self) -> impl Iterator<Item = (K, V)> {
        self.entries
            .into_iter()
            .flatten()
            .map(|entry| (entry.key, entry.value))
    }

    fn grow(&mut self) -> Result<(), RuntimeError> {
        let new_capacity = self.capacity() * 2;
        if new_capacity > MAX_CAPACITY {
            return Err(RuntimeError::CapacityExceeded {
                what: "sparse map",
                limit: MAX_CAPACITY,
            });
        }
        let mut old = Vec::new();
        old.resize_with(new_capacity, || None);
        std::mem::swap(&mut self.entries, &mut old);
        self.mask = new_capacity as u32 - 1;
        self.grow_threshold = new_capacity * 3 / 4;

        let mask = self.mask as usize;
        for entry in old.into_iter().flatten() {
            let mut pos = self.ideal_position(entry.hash);
            while self.entries[pos].is_some() {
                pos = (pos + 1) & mask;
            }
            self.entries[pos] = Some(entry);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn new_map_uses_the_default_mask() {
        let map: SparseMap<i32, u8> = SparseMap::new();
        assert_eq!(map.mask(), DEFAULT_MASK);
        assert_eq!(map.capacity(), 4);
        assert_eq!(map.grow_threshold(), 3);
        assert!(map.is_empty());
    }

    #[test]
    fn ideal_position_masks_and_clips_to_non_negative() {
        let map: SparseMap<i32, u8> = SparseMap::with_mask(7);
        assert_eq!(map.ideal_position(5), 5);
        assert_eq!(map.ideal_position(8 + 5), 5);
        // Negative keys hash to all-ones words; the i32::MAX clip drops the
        // sign bit before masking.
        assert_eq!(map.ideal_position((-1i32).hash_index()), 7);
    }

    #[test]
    fn colliding_keys_all_resolve_to_their_own_value() {
        // Under mask 7, keys 1, 9, 17, 25 share ideal bucket 1.
        let mut map: SparseMap<i32, i32> = SparseMap::with_mask(7);
        for (i, key) in [1, 9, 17, 25].into_iter().enumerate() {
            map.insert(key, i as i32 * 100).unwrap();
        }
        assert_eq!(map.get(1), Some(&0));
        assert_eq!(map.get(9), Some(&100));
        assert_eq!(map.get(17), Some(&200));
        assert_eq!(map.get(25), Some(&300));
        assert_eq!(map.get(33), None);
    }

    #[test]
    fn insert_replaces_and_returns_the_old_value() {
        let mut map: SparseMap<i32, &str> = SparseMap::new();
        assert_eq!(map.insert(7, "a").unwrap(), None);
        assert_eq!(map.insert(7, "b").unwrap(), Some("a"));
        assert_eq!(map.get(7), Some(&"b"));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn remove_reports_absent_afterwards_and_keeps_survivors() {
        let mut map: SparseMap<i32, i32> = SparseMap::with_mask(7);
        // A colliding cluster spanning buckets 1..=4.
        for key in [1, 9, 17, 25] {
            map.insert(key, key * 10).unwrap();
        }
        assert_eq!(map.remove(9), Some(90));
        assert_eq!(map.get(9), None);
        // Followers were backward-shifted; every survivor still resolves.
        assert_eq!(map.get(1), Some(&10));
        assert_eq!(map.get(17), Some(&170));
        assert_eq!(map.get(25), Some(&250));
        assert_eq!(map.remove(9), None);
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn remove_head_of_chain_keeps_the_tail_reachable() {
        let mut map: SparseMap<i32, i32> = SparseMap::with_mask(7);
        for key in [2, 10, 18] {
            map.insert(key, key).unwrap();
        }
        assert_eq!(map.remove(2), Some(2));
        assert_eq!(map.get(10), Some(&10));
        assert_eq!(map.get(18), Some(&18));
    }

    #[test]
    fn growth_preserves_every_mapping() {
        let mut map: SparseMap<i32, i32> = SparseMap::new();
        for key in 0..100 {
            map.insert(key, key * 3).unwrap();
        }
        assert!(map.capacity() > 4);
        assert_eq!(map.len(), 100);
        for key in 0..100 {
            assert_eq!(map.get(key), Some(&(key * 3)), "key {key} lost");
        }
    }

    #[test]
    fn growth_keeps_load_under_the_threshold() {
        let mut map: SparseMap<i32, ()> = SparseMap::new();
        for key in 0..64 {
            map.insert(key, ()).unwrap();
        }
        assert!(map.len() <= map.grow_threshold());
        assert_eq!(map.grow_threshold(), map.capacity() * 3 / 4);
    }

    #[test]
    fn wrapping_probe_chains_survive_removal() {
        // Keys whose ideal bucket is the last slot force probes to wrap to
        // bucket 0.
        let mut map: SparseMap<i32, i32> = SparseMap::with_mask(7);
        for key in [7, 15, 23] {
            map.insert(key, key).unwrap();
        }
        assert_eq!(map.remove(7), Some(7));
        assert_eq!(map.get(15), Some(&15));
        assert_eq!(map.get(23), Some(&23));
    }

    #[test]
    fn matches_a_reference_model_under_random_churn() {
        let mut map: SparseMap<i32, i32> = SparseMap::new();
        let mut model = std::collections::HashMap::new();
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..4000 {
            let key = rng.random_range(0..256);
            if rng.random_bool(0.6) {
                let value = rng.random_range(0..1_000_000);
                assert_eq!(
                    map.insert(key, value).unwrap(),
                    model.insert(key, value)
                );
            } else {
                assert_eq!(map.remove(key), model.remove(&key));
            }
        }

        assert_eq!(map.len(), model.len());
        for (key, value) in &model {
            assert_eq!(map.get(*key), Some(value));
        }
    }

    #[test]
    fn into_entries_yields_every_pair() {
        let mut map: SparseMap<i32, i32> = SparseMap::new();
        for key in [3, 11, 42] {
            map.insert(key, -key).unwrap();
        }
        let mut pairs: Vec<_> = map.into_entries().collect();
        pairs.sort();
        assert_eq!(pairs, vec![(3, -3), (11, -11), (42, -42)]);
    }
}
