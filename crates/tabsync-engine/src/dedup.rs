//! Bounded recency set of processed message timestamps.

use std::collections::{HashMap, VecDeque};

/// Timestamps already processed for one store, remembered for a window.
///
/// Entries expire `window_ms` after they were recorded; beyond `capacity`
/// the oldest entry is evicted early.
#[derive(Debug)]
pub struct RecentKeys {
    window_ms: u64,
    capacity: usize,
    seen: HashMap<u64, u64>,
    order: VecDeque<(u64, u64)>,
}

impl RecentKeys {
    #[must_use]
    pub fn new(window_ms: u64, capacity: usize) -> Self {
        Self {
            window_ms,
            capacity: capacity.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `timestamp` as processed at `now`.
    ///
    /// Returns `false` if it was already seen within the window.
    pub fn insert(&mut self, timestamp: u64, now: u64) -> bool {
        self.expire(now);
        if self.seen.contains_key(&timestamp) {
            return false;
        }

        self.seen.insert(timestamp, now);
        self.order.push_back((timestamp, now));
        while self.order.len() > self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    fn expire(&mut self, now: u64) {
        while let Some(&(timestamp, recorded)) = self.order.front() {
            if now.saturating_sub(recorded) < self.window_ms {
                break;
            }
            self.order.pop_front();
            self.seen.remove(&timestamp);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_window() {
        let mut keys = RecentKeys::new(1000, 16);
        assert!(keys.insert(42, 0));
        assert!(!keys.insert(42, 500));
        assert!(keys.insert(43, 500));
    }

    #[test]
    fn test_entries_expire() {
        let mut keys = RecentKeys::new(1000, 16);
        assert!(keys.insert(42, 0));
        assert!(keys.insert(42, 1000));
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn test_capacity_bound() {
        let mut keys = RecentKeys::new(1000, 3);
        for ts in 0..10 {
            keys.insert(ts, 0);
        }
        assert_eq!(keys.len(), 3);
        assert!(keys.insert(0, 0));
        assert!(!keys.insert(9, 0));
    }
}
