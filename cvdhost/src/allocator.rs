//! Unique resource allocation with RAII reservations.
//!
//! An allocator owns two disjoint sets of values, `available` and
//! `allocated`. Handing out a value moves it to `allocated` and wraps it in a
//! [`Reservation`]; dropping the reservation moves it back.
//!
//! Reservations keep a weak back-reference to the allocator's pools, so an
//! allocator dropped before its reservations only produces a warning when the
//! stragglers are released.

use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

struct Pools<T> {
    available: HashSet<T>,
    allocated: HashSet<T>,
}

impl<T: Eq + Hash + Clone> Pools<T> {
    fn is_available(&self, value: &T) -> bool {
        self.available.contains(value)
    }

    fn is_known(&self, value: &T) -> bool {
        self.available.contains(value) || self.allocated.contains(value)
    }
}

/// Integral types that support consecutive and range reservations.
pub trait Integral: Copy + Eq + Hash + Ord + fmt::Debug {
    /// `self + n`, or `None` on overflow.
    fn offset(self, n: usize) -> Option<Self>;
}

macro_rules! impl_integral {
    ($($t:ty),*) => {
        $(
            impl Integral for $t {
                fn offset(self, n: usize) -> Option<Self> {
                    <$t>::try_from(n).ok().and_then(|n| self.checked_add(n))
                }
            }
        )*
    };
}

impl_integral!(u16, u32, u64, i32, i64, usize);

/// Thread-safe pool of unique values.
///
/// All operations are serialized by a single mutex.
pub struct UniqueResourceAllocator<T> {
    pools: Arc<Mutex<Pools<T>>>,
}

impl<T> fmt::Debug for UniqueResourceAllocator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UniqueResourceAllocator").finish()
    }
}

impl<T: Eq + Hash + Clone + fmt::Debug> UniqueResourceAllocator<T> {
    /// Create an allocator over `pool`. Duplicates are coalesced.
    pub fn new(pool: impl IntoIterator<Item = T>) -> Self {
        Self {
            pools: Arc::new(Mutex::new(Pools {
                available: pool.into_iter().collect(),
                allocated: HashSet::new(),
            })),
        }
    }

    /// Create a shared allocator over `pool`.
    pub fn create(pool: impl IntoIterator<Item = T>) -> Arc<Self> {
        Arc::new(Self::new(pool))
    }

    /// Add values to the pool.
    ///
    /// # Returns
    /// The values that were rejected because the allocator already knows them,
    /// whether available or allocated.
    pub fn expand_pool(&self, values: impl IntoIterator<Item = T>) -> HashSet<T> {
        let mut pools = self.pools.lock();
        let mut rejected = HashSet::new();
        for value in values {
            if pools.is_known(&value) {
                rejected.insert(value);
            } else {
                pools.available.insert(value);
            }
        }
        rejected
    }

    /// Reserve one arbitrary value, or `None` when the pool is empty.
    pub fn unique_item(&self) -> Option<Reservation<T>> {
        let mut pools = self.pools.lock();
        let value = pools.available.iter().next().cloned()?;
        Some(self.reserve(&mut pools, value))
    }

    /// Reserve `n` arbitrary values, all or nothing.
    ///
    /// Returns `None` when `n == 0` or fewer than `n` values are available.
    pub fn unique_items(&self, n: usize) -> Option<HashSet<Reservation<T>>> {
        let mut pools = self.pools.lock();
        if n == 0 || pools.available.len() < n {
            return None;
        }
        let values: Vec<T> = pools.available.iter().take(n).cloned().collect();
        Some(
            values
                .into_iter()
                .map(|value| self.reserve(&mut pools, value))
                .collect(),
        )
    }

    /// Reserve a specific value, or `None` if it is not available.
    pub fn take(&self, value: T) -> Option<Reservation<T>> {
        let mut pools = self.pools.lock();
        if !pools.is_available(&value) {
            return None;
        }
        Some(self.reserve(&mut pools, value))
    }

    /// Reserve every value in `values` atomically.
    ///
    /// If any one is unavailable (or listed twice) nothing is reserved.
    pub fn take_all(&self, values: impl IntoIterator<Item = T>) -> Option<Vec<Reservation<T>>> {
        let values: Vec<T> = values.into_iter().collect();
        let mut pools = self.pools.lock();
        self.take_all_locked(&mut pools, values)
    }

    /// Number of values currently available.
    pub fn available_count(&self) -> usize {
        self.pools.lock().available.len()
    }

    /// Number of values currently reserved.
    pub fn allocated_count(&self) -> usize {
        self.pools.lock().allocated.len()
    }

    fn take_all_locked(&self, pools: &mut Pools<T>, values: Vec<T>) -> Option<Vec<Reservation<T>>> {
        let mut seen = HashSet::with_capacity(values.len());
        for value in &values {
            if !pools.is_available(value) || !seen.insert(value) {
                return None;
            }
        }
        Some(
            values
                .into_iter()
                .map(|value| self.reserve(pools, value))
                .collect(),
        )
    }

    fn reserve(&self, pools: &mut Pools<T>, value: T) -> Reservation<T> {
        pools.available.remove(&value);
        pools.allocated.insert(value.clone());
        Reservation {
            value,
            pools: Arc::downgrade(&self.pools),
        }
    }
}

impl<T: Integral> UniqueResourceAllocator<T> {
    /// Reserve `n` consecutive values `[s, s + n)`, returned in ascending order.
    ///
    /// Runs are searched in hash order, so callers must not rely on which run
    /// is chosen. Returns `None` when `n == 0` or no run exists.
    pub fn unique_consecutive_items(&self, n: usize) -> Option<Vec<Reservation<T>>> {
        if n == 0 {
            return None;
        }
        let mut pools = self.pools.lock();
        if pools.available.len() < n {
            return None;
        }
        let start = pools.available.iter().copied().find(|start| {
            (1..n).all(|k| {
                start
                    .offset(k)
                    .is_some_and(|value| pools.available.contains(&value))
            })
        })?;
        let values = (0..n).filter_map(|k| start.offset(k)).collect();
        self.take_all_locked(&mut pools, values)
    }

    /// Reserve every value in `[lo, hi)` atomically.
    ///
    /// An empty range (`lo == hi`) succeeds with no reservations; an inverted
    /// range returns `None`.
    pub fn take_range(&self, lo: T, hi: T) -> Option<Vec<Reservation<T>>> {
        if hi < lo {
            return None;
        }
        let mut values = Vec::new();
        let mut current = lo;
        while current < hi {
            values.push(current);
            current = current.offset(1)?;
        }
        let mut pools = self.pools.lock();
        self.take_all_locked(&mut pools, values)
    }
}

/// Exclusive hold on one allocator value. Returned to the pool on drop.
pub struct Reservation<T: Eq + Hash + Clone + fmt::Debug> {
    value: T,
    pools: Weak<Mutex<Pools<T>>>,
}

impl<T: Eq + Hash + Clone + fmt::Debug> Reservation<T> {
    pub fn get(&self) -> &T {
        &self.value
    }
}

impl<T: Integral> Reservation<T> {
    pub fn value(&self) -> T {
        self.value
    }
}

impl<T: Eq + Hash + Clone + fmt::Debug> Drop for Reservation<T> {
    fn drop(&mut self) {
        let Some(pools) = self.pools.upgrade() else {
            tracing::warn!(value = ?self.value, "Reservation outlived its allocator");
            return;
        };
        let mut pools = pools.lock();
        if pools.allocated.remove(&self.value) {
            pools.available.insert(self.value.clone());
        } else {
            tracing::warn!(value = ?self.value, "Releasing a value unknown to the allocator");
        }
    }
}

impl<T: Eq + Hash + Clone + fmt::Debug> PartialEq for Reservation<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: Eq + Hash + Clone + fmt::Debug> Eq for Reservation<T> {}

impl<T: Eq + Hash + Clone + fmt::Debug> Hash for Reservation<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<T: Eq + Hash + Clone + fmt::Debug> fmt::Debug for Reservation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Reservation").field(&self.value).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted<T: Integral>(reservations: &[Reservation<T>]) -> Vec<T> {
        let mut values: Vec<T> = reservations.iter().map(|r| r.value()).collect();
        values.sort();
        values
    }

    #[test]
    fn test_duplicates_coalesced() {
        let allocator = UniqueResourceAllocator::new([1u32, 1, 2]);
        assert_eq!(allocator.available_count(), 2);
    }

    #[test]
    fn test_unique_item_until_empty() {
        let allocator = UniqueResourceAllocator::new([7u32]);
        let first = allocator.unique_item().unwrap();
        assert_eq!(first.value(), 7);
        assert!(allocator.unique_item().is_none());
        drop(first);
        assert_eq!(allocator.unique_item().unwrap().value(), 7);
    }

    #[test]
    fn test_consecutive_basic_scenario() {
        let allocator = UniqueResourceAllocator::new([5u32, 6, 7]);
        let pair = allocator.unique_consecutive_items(2).unwrap();
        let values = sorted(&pair);
        assert!(values == vec![5, 6] || values == vec![6, 7], "{values:?}");
        assert!(allocator.unique_consecutive_items(3).is_none());
        drop(pair);
        let all = allocator.unique_consecutive_items(3).unwrap();
        assert_eq!(sorted(&all), vec![5, 6, 7]);
    }

    #[test]
    fn test_consecutive_boundaries() {
        let allocator = UniqueResourceAllocator::new([1u16, 2, 3]);
        assert!(allocator.unique_consecutive_items(0).is_none());
        assert!(allocator.unique_consecutive_items(4).is_none());
        let gapped = UniqueResourceAllocator::new([1u16, 3, 5]);
        assert!(gapped.unique_consecutive_items(2).is_none());
    }

    #[test]
    fn test_consecutive_returns_ascending() {
        let allocator = UniqueResourceAllocator::new(10u32..20);
        let run = allocator.unique_consecutive_items(4).unwrap();
        let values: Vec<u32> = run.iter().map(|r| r.value()).collect();
        assert!(values.windows(2).all(|w| w[1] == w[0] + 1), "{values:?}");
    }

    #[test]
    fn test_expand_pool_scenario() {
        let allocator = UniqueResourceAllocator::new([1u32]);
        let rejected = allocator.expand_pool([1, 2, 3]);
        assert_eq!(rejected, HashSet::from([1]));
        let items = allocator.unique_items(3).unwrap();
        let mut values: Vec<u32> = items.iter().map(|r| r.value()).collect();
        values.sort();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_expand_rejects_allocated_values() {
        let allocator = UniqueResourceAllocator::new([4u32]);
        let held = allocator.take(4).unwrap();
        assert_eq!(allocator.expand_pool([4, 5]), HashSet::from([4]));
        drop(held);
        assert_eq!(allocator.available_count(), 2);
    }

    #[test]
    fn test_unique_items_all_or_nothing() {
        let allocator = UniqueResourceAllocator::new([1u32, 2]);
        assert!(allocator.unique_items(0).is_none());
        assert!(allocator.unique_items(3).is_none());
        assert_eq!(allocator.available_count(), 2);
        assert_eq!(allocator.unique_items(2).unwrap().len(), 2);
    }

    #[test]
    fn test_take_specific_value() {
        let allocator = UniqueResourceAllocator::new(["a".to_string(), "b".to_string()]);
        let a = allocator.take("a".to_string()).unwrap();
        assert_eq!(a.get(), "a");
        assert!(allocator.take("a".to_string()).is_none());
        assert!(allocator.take("z".to_string()).is_none());
    }

    #[test]
    fn test_take_all_is_atomic() {
        let allocator = UniqueResourceAllocator::new([1u32, 2, 3]);
        let held = allocator.take(3).unwrap();
        assert!(allocator.take_all([1, 2, 3]).is_none());
        assert_eq!(allocator.available_count(), 2);
        assert!(allocator.take_all([1, 1]).is_none());
        assert_eq!(allocator.available_count(), 2);
        drop(held);
        assert_eq!(allocator.take_all([1, 2, 3]).unwrap().len(), 3);
    }

    #[test]
    fn test_take_range() {
        let allocator = UniqueResourceAllocator::new(100u16..110);
        assert!(allocator.take_range(105, 105).unwrap().is_empty());
        assert!(allocator.take_range(106, 105).is_none());
        let range = allocator.take_range(100, 104).unwrap();
        assert_eq!(sorted(&range), vec![100, 101, 102, 103]);
        assert!(allocator.take_range(103, 106).is_none());
        assert!(allocator.take_range(108, 111).is_none());
        assert_eq!(allocator.available_count(), 6);
    }

    #[test]
    fn test_sets_stay_disjoint() {
        let allocator = UniqueResourceAllocator::new(0u32..8);
        let a = allocator.unique_items(3).unwrap();
        let b = allocator.unique_consecutive_items(2);
        let total = allocator.available_count() + allocator.allocated_count();
        assert_eq!(total, 8);
        drop(a);
        drop(b);
        assert_eq!(allocator.available_count(), 8);
        assert_eq!(allocator.allocated_count(), 0);
    }

    #[test]
    fn test_reservation_outliving_allocator() {
        let allocator = UniqueResourceAllocator::new([1u32]);
        let held = allocator.unique_item().unwrap();
        drop(allocator);
        drop(held);
    }

    #[test]
    fn test_concurrent_reservations_are_unique() {
        let allocator = UniqueResourceAllocator::create(0u32..64);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || {
                    (0..8)
                        .map(|_| allocator.unique_item().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut seen = HashSet::new();
        let mut held = Vec::new();
        for handle in handles {
            for reservation in handle.join().unwrap() {
                assert!(seen.insert(reservation.value()));
                held.push(reservation);
            }
        }
        assert_eq!(allocator.available_count(), 0);
    }
}
