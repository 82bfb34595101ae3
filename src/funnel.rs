use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::Index;

use tracing::{trace, warn};

use crate::common::{Entry, empty_slots};
use crate::error::{FunnelError, Result};
use crate::layout::{FunnelConfig, Layout, Region};

/// Outcome of walking a key's full candidate sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    Occupied(usize),
    /// Key absent; holds the slot a new entry should take, if any.
    Vacant(Option<usize>),
}

/// A fixed-capacity hash map using funnel hashing.
///
/// Every operation inspects at most [`scan_budget`](Self::scan_budget)
/// slots regardless of load or deletion history. The map never grows: once
/// it holds [`capacity`](Self::capacity) entries, inserting a new key fails
/// with [`FunnelError::CapacityExceeded`].
#[derive(Clone)]
pub struct FunnelHashMap<K, V, S = RandomState> {
    slots: Vec<Option<Entry<K, V>>>,
    layout: Layout,
    len: usize,
    hash_builder: S,
}

impl<K, V> FunnelHashMap<K, V, RandomState>
where
    K: Eq + Hash,
{
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::with_config(capacity, FunnelConfig::default(), RandomState::new())
    }

    pub fn with_reserve_fraction(capacity: usize, reserve_fraction: f64) -> Result<Self> {
        Self::with_config(
            capacity,
            FunnelConfig::with_reserve_fraction(reserve_fraction),
            RandomState::new(),
        )
    }

    /// Builds a map of `capacity` and inserts `pairs` in order. Later pairs
    /// overwrite earlier ones with the same key.
    pub fn from_pairs<I>(capacity: usize, pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut map = Self::with_capacity(capacity)?;
        map.try_extend(pairs)?;
        Ok(map)
    }
}

impl<K, V, S> FunnelHashMap<K, V, S> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.layout.capacity()
    }

    /// Maximum number of live entries.
    pub fn capacity(&self) -> usize {
        self.layout.capacity()
    }

    pub fn physical_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn scan_budget(&self) -> usize {
        self.layout.scan_budget()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn hasher(&self) -> &S {
        &self.hash_builder
    }

    /// Removes every entry. Capacity and layout are kept.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.len = 0;
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            slots: self.slots.iter(),
            remaining: self.len,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, value)| value)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> + '_ {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.as_mut().map(|entry| &mut entry.value))
    }
}

impl<K, V, S> FunnelHashMap<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Result<Self> {
        Self::with_config(capacity, FunnelConfig::default(), hash_builder)
    }

    pub fn with_config(capacity: usize, config: FunnelConfig, hash_builder: S) -> Result<Self> {
        let layout = Layout::new(capacity, config)?;
        Ok(Self {
            slots: empty_slots(layout.physical_slots()),
            layout,
            len: 0,
            hash_builder,
        })
    }

    /// Inserts `value` under `key`, returning the previous value if the key
    /// was already present.
    ///
    /// Overwriting never fails. A new key fails with
    /// [`FunnelError::CapacityExceeded`] when the map is full, or with
    /// [`FunnelError::StructuralOverflow`] when its candidate sequence has no
    /// empty slot. The map is unchanged on error.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        let key_hash = self.hash_key(&key);

        let vacant = match self.place(key_hash, &key) {
            Placement::Occupied(slot_idx) => {
                return Ok(self.slots[slot_idx]
                    .as_mut()
                    .map(|entry| std::mem::replace(&mut entry.value, value)));
            }
            Placement::Vacant(vacant) => vacant,
        };

        let capacity = self.layout.capacity();
        if self.len >= capacity {
            trace!(capacity, "rejected insert into full funnel map");
            return Err(FunnelError::CapacityExceeded { capacity });
        }

        let Some(slot_idx) = vacant else {
            warn!(
                len = self.len,
                capacity,
                scan_budget = self.layout.scan_budget(),
                "funnel map candidate sequence exhausted"
            );
            return Err(FunnelError::StructuralOverflow {
                len: self.len,
                capacity,
            });
        };

        self.slots[slot_idx] = Some(Entry { key, value });
        self.len += 1;
        Ok(None)
    }

    /// Inserts every pair in order, stopping at the first error. Pairs
    /// inserted before the failing one stay in the map.
    pub fn try_extend<I>(&mut self, pairs: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in pairs {
            self.insert(key, value)?;
        }
        Ok(())
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_key_value(key).map(|(_, value)| value)
    }

    pub fn get_key_value<Q>(&self, key: &Q) -> Option<(&K, &V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot_idx = self.find_slot(key)?;
        self.slots[slot_idx]
            .as_ref()
            .map(|entry| (&entry.key, &entry.value))
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot_idx = self.find_slot(key)?;
        self.slots[slot_idx]
            .as_mut()
            .map(|entry| &mut entry.value)
    }

    /// Like [`get`](Self::get) but reports a missing key as
    /// [`FunnelError::KeyNotFound`].
    pub fn try_get<Q>(&self, key: &Q) -> Result<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).ok_or(FunnelError::KeyNotFound)
    }

    pub fn get_or<'a, Q>(&'a self, key: &Q, default: &'a V) -> &'a V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).unwrap_or(default)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.find_slot(key).is_some()
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove_entry(key).map(|(_, value)| value)
    }

    pub fn remove_entry<Q>(&mut self, key: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot_idx = self.find_slot(key)?;
        let removed = self.slots[slot_idx].take()?;
        self.len -= 1;
        Some((removed.key, removed.value))
    }

    /// Like [`remove`](Self::remove) but reports a missing key as
    /// [`FunnelError::KeyNotFound`].
    pub fn pop<Q>(&mut self, key: &Q) -> Result<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove(key).ok_or(FunnelError::KeyNotFound)
    }

    fn hash_key<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        self.hash_builder.hash_one(key)
    }

    // Scans every candidate bucket. An empty slot says nothing about later
    // buckets, since removals leave holes behind.
    fn find_slot<Q>(&self, key: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.len == 0 {
            return None;
        }

        let key_hash = self.hash_key(key);
        self.layout
            .candidates(key_hash)
            .flat_map(|candidate| candidate.slots())
            .find(|&slot_idx| {
                self.slots[slot_idx]
                    .as_ref()
                    .is_some_and(|entry| entry.key.borrow() == key)
            })
    }

    // A new key takes the first empty slot in level order. Past the levels it
    // goes to whichever backyard choice has more room, the first on a tie.
    fn place<Q>(&self, key_hash: u64, key: &Q) -> Placement
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut level_vacant = None;
        let mut backyard_vacant: Option<(usize, usize)> = None;

        for candidate in self.layout.candidates(key_hash) {
            let mut first_free = None;
            let mut free = 0;
            for slot_idx in candidate.slots() {
                match &self.slots[slot_idx] {
                    Some(entry) if entry.key.borrow() == key => {
                        return Placement::Occupied(slot_idx);
                    }
                    Some(_) => {}
                    None => {
                        first_free.get_or_insert(slot_idx);
                        free += 1;
                    }
                }
            }

            let Some(slot_idx) = first_free else {
                continue;
            };
            match candidate.region {
                Region::Level(_) => {
                    level_vacant.get_or_insert(slot_idx);
                }
                Region::Backyard(_) => {
                    if backyard_vacant.is_none_or(|(_, most_free)| free > most_free) {
                        backyard_vacant = Some((slot_idx, free));
                    }
                }
            }
        }

        Placement::Vacant(level_vacant.or(backyard_vacant.map(|(slot_idx, _)| slot_idx)))
    }
}

impl<K, Q, V, S> Index<&Q> for FunnelHashMap<K, V, S>
where
    K: Eq + Hash + Borrow<Q>,
    Q: Eq + Hash + ?Sized,
    S: BuildHasher,
{
    type Output = V;

    /// # Panics
    ///
    /// Panics if the key is not present.
    fn index(&self, key: &Q) -> &V {
        self.get(key).expect("key not found in FunnelHashMap")
    }
}

impl<K, V, S> fmt::Debug for FunnelHashMap<K, V, S>
where
    K: fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, S> PartialEq for FunnelHashMap<K, V, S>
where
    K: Eq + Hash,
    V: PartialEq,
    S: BuildHasher,
{
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len
            && self
                .iter()
                .all(|(key, value)| other.get(key).is_some_and(|other| *value == *other))
    }
}

impl<K, V, S> Eq for FunnelHashMap<K, V, S>
where
    K: Eq + Hash,
    V: Eq,
    S: BuildHasher,
{
}

/// Borrowing iterator over a map's entries, in slot order.
#[derive(Debug, Clone)]
pub struct Iter<'a, K, V> {
    slots: std::slice::Iter<'a, Option<Entry<K, V>>>,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.slots.by_ref().find_map(Option::as_ref)?;
        self.remaining -= 1;
        Some((&entry.key, &entry.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for Iter<'_, K, V> {}

/// Owning iterator over a map's entries, in slot order.
#[derive(Debug)]
pub struct IntoIter<K, V> {
    slots: std::vec::IntoIter<Option<Entry<K, V>>>,
    remaining: usize,
}

impl<K, V> Iterator for IntoIter<K, V> {
    type Item = (K, V);

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.slots.by_ref().flatten().next()?;
        self.remaining -= 1;
        Some((entry.key, entry.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for IntoIter<K, V> {}

impl<'a, K, V, S> IntoIterator for &'a FunnelHashMap<K, V, S> {
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V, S> IntoIterator for FunnelHashMap<K, V, S> {
    type Item = (K, V);
    type IntoIter = IntoIter<K, V>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter {
            slots: self.slots.into_iter(),
            remaining: self.len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Candidate;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::hash::{BuildHasherDefault, Hasher};

    /// Sends every key down the same candidate sequence.
    #[derive(Debug, Default, Clone)]
    struct CollidingHasher;

    impl Hasher for CollidingHasher {
        fn finish(&self) -> u64 {
            0x5EED
        }

        fn write(&mut self, _bytes: &[u8]) {}
    }

    type CollidingState = BuildHasherDefault<CollidingHasher>;

    fn colliding_map(capacity: usize) -> FunnelHashMap<u32, u32, CollidingState> {
        FunnelHashMap::with_capacity_and_hasher(capacity, CollidingState::default())
            .expect("capacity is positive")
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let result = FunnelHashMap::<i32, i32>::with_capacity(0);
        assert_eq!(result.err(), Some(FunnelError::InvalidCapacity));
    }

    #[test]
    fn logical_and_physical_sizes_are_distinct() {
        let map: FunnelHashMap<i32, i32> = FunnelHashMap::with_capacity(257).unwrap();
        assert_eq!(map.capacity(), 257);
        assert!(map.physical_slots() > map.capacity());
        assert_eq!(map.physical_slots(), map.layout().physical_slots());
    }

    #[test]
    fn insert_get_and_update_work() {
        let mut map = FunnelHashMap::with_capacity(512).unwrap();

        for key in 0..120 {
            assert_eq!(map.insert(key, key * 10), Ok(None));
        }
        for key in 0..120 {
            assert_eq!(map.get(&key), Some(&(key * 10)));
        }

        assert_eq!(map.insert(7, 777), Ok(Some(70)));
        assert_eq!(map.get(&7), Some(&777));
        assert_eq!(map.len(), 120);
    }

    #[test]
    fn fills_to_capacity_then_rejects() {
        let mut map = FunnelHashMap::with_capacity(300).unwrap();
        for key in 0..300u64 {
            map.insert(key, key).unwrap();
        }
        assert!(map.is_full());
        assert_eq!(
            map.insert(300, 300),
            Err(FunnelError::CapacityExceeded { capacity: 300 })
        );
        assert_eq!(map.len(), 300);
        assert!(!map.contains_key(&300));
    }

    #[test]
    fn overwrite_succeeds_when_full() {
        let mut map = FunnelHashMap::with_capacity(3).unwrap();
        map.try_extend([(1, "a"), (2, "b"), (3, "c")]).unwrap();
        assert_eq!(map.insert(2, "z"), Ok(Some("b")));
        assert_eq!(map.len(), 3);
        assert_eq!(map[&2], "z");
    }

    #[test]
    fn get_mut_and_contains_key_work() {
        let mut map = FunnelHashMap::with_capacity(16).unwrap();
        map.insert("alpha".to_string(), 1).unwrap();

        if let Some(value) = map.get_mut("alpha") {
            *value = 5;
        }
        assert_eq!(map.get("alpha"), Some(&5));
        assert!(map.contains_key("alpha"));
        assert!(!map.contains_key("beta"));
        assert_eq!(map.get_mut("beta"), None);
    }

    #[test]
    fn remove_and_clear_work_with_borrowed_keys() {
        let mut map: FunnelHashMap<String, i32> = FunnelHashMap::with_capacity(256).unwrap();
        assert_eq!(map.insert("alpha".to_string(), 1), Ok(None));
        assert_eq!(map.insert("beta".to_string(), 2), Ok(None));

        assert!(map.contains_key("alpha"));
        assert_eq!(map.remove("alpha"), Some(1));
        assert_eq!(map.remove("alpha"), None);
        assert_eq!(map.pop("alpha"), Err(FunnelError::KeyNotFound));

        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.get("beta"), None);
        assert_eq!(map.capacity(), 256);
    }

    #[test]
    fn defaults_and_fallible_lookups() {
        let map = FunnelHashMap::from_pairs(8, [("foo", 1)]).unwrap();
        assert_eq!(map.get_or("foo", &0), &1);
        assert_eq!(map.get_or("bar", &0), &0);
        assert_eq!(map.try_get("foo"), Ok(&1));
        assert_eq!(map.try_get("bar"), Err(FunnelError::KeyNotFound));
        assert_eq!(map.get_key_value("foo"), Some((&"foo", &1)));
    }

    #[test]
    #[should_panic(expected = "key not found")]
    fn index_panics_on_missing_key() {
        let map: FunnelHashMap<i32, i32> = FunnelHashMap::with_capacity(4).unwrap();
        let _ = map[&1];
    }

    #[test]
    fn preload_beyond_capacity_fails() {
        let result = FunnelHashMap::from_pairs(3, (0..4).map(|key| (key, key)));
        assert_eq!(
            result.err(),
            Some(FunnelError::CapacityExceeded { capacity: 3 })
        );
    }

    #[test]
    fn preload_with_duplicate_keys_keeps_last_value() {
        let map = FunnelHashMap::from_pairs(2, [(1, 'a'), (2, 'b'), (1, 'c')]).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&1], 'c');
    }

    #[test]
    fn structural_overflow_when_candidates_are_exhausted() {
        let mut map = colliding_map(100);
        let budget = map.scan_budget() as u32;
        assert!((budget as usize) < map.capacity());

        for key in 0..budget {
            assert_eq!(map.insert(key, key), Ok(None));
        }
        assert_eq!(
            map.insert(budget, budget),
            Err(FunnelError::StructuralOverflow {
                len: budget as usize,
                capacity: 100,
            })
        );

        assert_eq!(map.len(), budget as usize);
        assert!(!map.contains_key(&budget));
        for key in 0..budget {
            assert_eq!(map.get(&key), Some(&key));
        }

        // Overwrites still succeed on an exhausted sequence.
        assert_eq!(map.insert(0, 99), Ok(Some(0)));
    }

    #[test]
    fn holes_do_not_hide_later_keys() {
        let mut map = colliding_map(100);
        let budget = map.scan_budget() as u32;
        for key in 0..budget {
            map.insert(key, key).unwrap();
        }

        // Key 0 sits in the first slot of the first level bucket.
        assert_eq!(map.remove(&0), Some(0));
        for key in 1..budget {
            assert!(map.contains_key(&key), "key {key} lost after removal");
        }

        // The freed slot is reused.
        assert_eq!(map.insert(budget, budget), Ok(None));
        assert_eq!(map.get(&budget), Some(&budget));
        assert_eq!(map.len(), budget as usize);
    }

    #[test]
    fn colliding_keys_fill_candidates_in_order() {
        let mut map = colliding_map(100);
        let candidates: Vec<_> = map.layout().candidates(0x5EED).collect();
        let first = candidates[0];

        for key in 0..first.width as u32 {
            map.insert(key, key).unwrap();
        }
        for slot_idx in first.slots() {
            assert!(map.slots[slot_idx].is_some());
        }

        map.insert(1000, 1000).unwrap();
        let second = candidates[1];
        assert_eq!(
            map.slots[second.start].as_ref().map(|entry| entry.key),
            Some(1000)
        );
    }

    #[test]
    fn iteration_visits_every_entry_once() {
        let mut map = FunnelHashMap::with_capacity(64).unwrap();
        for key in 0..40 {
            map.insert(key, key * 2).unwrap();
        }
        map.remove(&3);

        let iter = map.iter();
        assert_eq!(iter.len(), 39);

        let mut seen: Vec<_> = map.iter().map(|(&key, &value)| (key, value)).collect();
        seen.sort_unstable();
        let expected: Vec<_> = (0..40).filter(|&key| key != 3).map(|key| (key, key * 2)).collect();
        assert_eq!(seen, expected);

        let key_sum: i32 = map.keys().sum();
        assert_eq!(key_sum, (0..40).sum::<i32>() - 3);

        for value in map.values_mut() {
            *value += 1;
        }
        assert_eq!(map.values().copied().min(), Some(1));

        let owned: HashMap<_, _> = map.clone().into_iter().collect();
        assert_eq!(owned.len(), 39);
        assert_eq!(owned[&10], 21);
    }

    #[test]
    fn maps_with_same_entries_are_equal() {
        let left = FunnelHashMap::from_pairs(16, [(1, 1), (2, 2)]).unwrap();
        let mut right = FunnelHashMap::with_capacity_and_hasher(16, left.hasher().clone()).unwrap();
        right.insert(2, 2).unwrap();
        assert_ne!(left, right);
        right.insert(1, 1).unwrap();
        assert_eq!(left, right);
        right.insert(1, 5).unwrap();
        assert_ne!(left, right);
    }

    #[test]
    fn debug_formats_as_map() {
        let map = FunnelHashMap::from_pairs(4, [("k", 1)]).unwrap();
        assert_eq!(format!("{map:?}"), r#"{"k": 1}"#);
    }

    #[test]
    fn reserve_fraction_controls_overcommit() {
        let tight: FunnelHashMap<u64, u64> =
            FunnelHashMap::with_reserve_fraction(2048, 0.02).unwrap();
        let default: FunnelHashMap<u64, u64> = FunnelHashMap::with_capacity(2048).unwrap();
        assert!(tight.physical_slots() < default.physical_slots());
        assert_eq!(tight.capacity(), default.capacity());
    }

    #[test]
    fn backyard_prefers_the_emptier_choice() {
        let mut map = colliding_map(4096);
        let candidates: Vec<Candidate> = map.layout().candidates(0x5EED).collect();
        let level_slots: usize = candidates
            .iter()
            .filter(|candidate| matches!(candidate.region, Region::Level(_)))
            .map(|candidate| candidate.width)
            .sum();
        let backyard: Vec<Candidate> = candidates
            .iter()
            .filter(|candidate| matches!(candidate.region, Region::Backyard(_)))
            .copied()
            .collect();
        assert_eq!(backyard.len(), 2);

        for key in 0..(level_slots + 4) as u32 {
            assert_eq!(map.insert(key, key), Ok(None));
        }

        let occupied = |candidate: &Candidate| {
            candidate
                .slots()
                .filter(|&slot_idx| map.slots[slot_idx].is_some())
                .count()
        };
        assert_eq!(occupied(&backyard[0]), 2);
        assert_eq!(occupied(&backyard[1]), 2);
    }

    const SMALL_CAPACITY: usize = 32;
    const SMALL_KEY_MAX: u16 = 96;
    const LARGE_CAPACITY: usize = 1024;
    const LARGE_KEY_MAX: u16 = 1536;

    #[derive(Clone, Debug)]
    enum Op {
        Insert(u16, u32),
        Remove(u16),
        Get(u16),
        Clear,
    }

    fn op_strategy(key_max: u16) -> impl Strategy<Value = Op> {
        prop_oneof![
            2 => (0..key_max, any::<u32>()).prop_map(|(key, value)| Op::Insert(key, value)),
            1 => (0..key_max).prop_map(Op::Remove),
            1 => (0..key_max).prop_map(Op::Get),
        ]
    }

    fn check_against_model(
        capacity: usize,
        key_max: u16,
        ops: Vec<Op>,
    ) -> std::result::Result<(), TestCaseError> {
        let mut map = FunnelHashMap::with_capacity(capacity).unwrap();
        let mut model: HashMap<u16, u32> = HashMap::new();

        for op in ops {
            match op {
                Op::Insert(key, value) => match map.insert(key, value) {
                    Ok(previous) => {
                        prop_assert_eq!(previous, model.insert(key, value));
                    }
                    Err(FunnelError::CapacityExceeded { capacity: reported }) => {
                        prop_assert_eq!(reported, capacity);
                        prop_assert_eq!(model.len(), capacity);
                        prop_assert!(!model.contains_key(&key));
                    }
                    Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                },
                Op::Remove(key) => {
                    prop_assert_eq!(map.remove(&key), model.remove(&key));
                }
                Op::Get(key) => {
                    prop_assert_eq!(map.get(&key), model.get(&key));
                }
                Op::Clear => {
                    map.clear();
                    model.clear();
                }
            }
            prop_assert_eq!(map.len(), model.len());
        }

        for key in 0..key_max {
            prop_assert_eq!(map.get(&key), model.get(&key));
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_matches_std_hash_map(
            ops in proptest::collection::vec(
                prop_oneof![9 => op_strategy(SMALL_KEY_MAX), 1 => Just(Op::Clear)],
                0..512,
            )
        ) {
            check_against_model(SMALL_CAPACITY, SMALL_KEY_MAX, ops)?;
        }

        #[test]
        fn prop_full_map_accepts_one_key_after_one_removal(
            keys in proptest::collection::hash_set(any::<u64>(), SMALL_CAPACITY..=SMALL_CAPACITY),
            extra in any::<u64>(),
        ) {
            prop_assume!(!keys.contains(&extra));
            let mut map =
                FunnelHashMap::from_pairs(SMALL_CAPACITY, keys.iter().map(|&key| (key, ()))).unwrap();
            prop_assert!(map.is_full());
            prop_assert_eq!(
                map.insert(extra, ()),
                Err(FunnelError::CapacityExceeded { capacity: SMALL_CAPACITY })
            );

            let victim = *keys.iter().next().unwrap();
            prop_assert_eq!(map.remove(&victim), Some(()));
            prop_assert_eq!(map.insert(extra, ()), Ok(None));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        // Several buckets per level, so candidate sequences no longer cover
        // the whole table and the map churns at capacity.
        #[test]
        fn prop_matches_std_hash_map_with_multi_bucket_levels(
            ops in proptest::collection::vec(op_strategy(LARGE_KEY_MAX), 2048..4096)
        ) {
            check_against_model(LARGE_CAPACITY, LARGE_KEY_MAX, ops)?;
        }
    }
}
