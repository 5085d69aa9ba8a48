//! The ordered benchmark schedule ("course") shared by all candidates.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::run::InstanceSeed;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub entries: Vec<InstanceSeed>,
    /// Number of distinct benchmark instances the course was built from.
    pub initial_length: usize,
}

impl Course {
    pub fn new(entries: Vec<InstanceSeed>, initial_length: usize) -> Self {
        Self {
            entries,
            initial_length,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when `pairs` are exactly the first `pairs.len()` course entries,
    /// in any order.
    pub fn covers_prefix(&self, pairs: &[InstanceSeed]) -> bool {
        if pairs.len() > self.entries.len() {
            return false;
        }
        let prefix: HashSet<&InstanceSeed> = self.entries[..pairs.len()].iter().collect();
        let given: HashSet<&InstanceSeed> = pairs.iter().collect();
        given.len() == pairs.len() && prefix == given
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::InstanceId;

    fn course() -> Course {
        let entries = (0..4)
            .map(|i| InstanceSeed::new(InstanceId(i), 100 + i as u64))
            .collect();
        Course::new(entries, 4)
    }

    #[test]
    fn test_prefix_in_any_order_is_covered() {
        let c = course();
        let pairs = vec![c.entries[1], c.entries[0]];
        assert!(c.covers_prefix(&pairs));
    }

    #[test]
    fn test_gaps_are_not_covered() {
        let c = course();
        assert!(!c.covers_prefix(&[c.entries[0], c.entries[2]]));
        assert!(!c.covers_prefix(&[c.entries[0], c.entries[0]]));
    }

    #[test]
    fn test_empty_run_list_is_a_prefix() {
        assert!(course().covers_prefix(&[]));
    }
}
