//! Named set operations over instance ids.

use crate::types::MAX_INSTANCES;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A set of instance ids below [`MAX_INSTANCES`]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceSet(u8);

impl InstanceSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every id in `0..count`
    pub fn first_n(count: usize) -> Self {
        let count = count.min(MAX_INSTANCES);
        Self(((1u16 << count) - 1) as u8)
    }

    /// Bit n selects id n; bits past the capacity are dropped
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & InstanceSet::first_n(MAX_INSTANCES).0)
    }

    pub fn from_ids(ids: &[usize]) -> Self {
        let mut set = Self::empty();
        for &id in ids {
            set.insert(id);
        }
        set
    }

    /// Ids at or above the capacity are ignored
    pub fn insert(&mut self, id: usize) {
        if id < MAX_INSTANCES {
            self.0 |= 1 << id;
        }
    }

    pub fn remove(&mut self, id: usize) {
        if id < MAX_INSTANCES {
            self.0 &= !(1 << id);
        }
    }

    pub fn set(&mut self, id: usize, present: bool) {
        if present {
            self.insert(id);
        } else {
            self.remove(id);
        }
    }

    pub fn contains(&self, id: usize) -> bool {
        id < MAX_INSTANCES && self.0 & (1 << id) != 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn union(&self, other: InstanceSet) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(&self, other: InstanceSet) -> Self {
        Self(self.0 & other.0)
    }

    pub fn difference(&self, other: InstanceSet) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn is_superset(&self, other: InstanceSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Lowest id in the set
    pub fn first(&self) -> Option<usize> {
        self.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..MAX_INSTANCES).filter(move |i| bits & (1 << i) != 0)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for InstanceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove_contains() {
        let mut set = InstanceSet::empty();
        assert!(set.is_empty());
        set.insert(0);
        set.insert(2);
        assert!(set.contains(0));
        assert!(!set.contains(1));
        assert!(set.contains(2));
        assert_eq!(set.len(), 2);
        set.remove(0);
        assert_eq!(set.first(), Some(2));
    }

    #[test]
    fn test_out_of_range_ids_ignored() {
        let mut set = InstanceSet::empty();
        set.insert(MAX_INSTANCES);
        set.insert(200);
        assert!(set.is_empty());
        assert!(!set.contains(200));
    }

    #[test]
    fn test_set_algebra() {
        let a = InstanceSet::from_ids(&[0, 1]);
        let b = InstanceSet::from_ids(&[1, 2]);
        assert_eq!(a.union(b), InstanceSet::first_n(3));
        assert_eq!(a.intersection(b), InstanceSet::from_ids(&[1]));
        assert_eq!(a.difference(b), InstanceSet::from_ids(&[0]));
        assert!(InstanceSet::first_n(3).is_superset(a));
        assert!(!a.is_superset(b));
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_first_n_clamps_to_capacity() {
        assert_eq!(InstanceSet::first_n(0), InstanceSet::empty());
        assert_eq!(InstanceSet::first_n(10).len(), MAX_INSTANCES);
    }
}
