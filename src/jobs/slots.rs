//! Slot pool - process-wide execution capacity
//!
//! Owned by the scheduler loop; `available` always stays within
//! `0..=total`.

use tracing::error;

#[derive(Debug, Clone)]
pub struct SlotPool {
    total: u32,
    available: u32,
}

impl SlotPool {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            available: total,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn available(&self) -> u32 {
        self.available
    }

    pub fn in_use(&self) -> u32 {
        self.total - self.available
    }

    pub fn can_fit(&self, slots: u32) -> bool {
        slots <= self.available
    }

    /// Reserve `slots` if they are all free
    pub fn try_acquire(&mut self, slots: u32) -> bool {
        if slots == 0 || slots > self.available {
            return false;
        }
        self.available -= slots;
        true
    }

    /// Return `slots` to the pool
    pub fn release(&mut self, slots: u32) {
        let restored = self.available.saturating_add(slots);
        if restored > self.total {
            error!(
                "Slot release of {} would exceed capacity ({} available of {})",
                slots, self.available, self.total
            );
            self.available = self.total;
        } else {
            self.available = restored;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_acquire_and_release() {
        let mut pool = SlotPool::new(4);
        assert!(pool.try_acquire(4));
        assert_eq!(pool.available(), 0);
        assert!(!pool.try_acquire(1));
        pool.release(3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.in_use(), 1);
        assert!(!pool.try_acquire(0));
    }

    #[test]
    fn test_over_release_is_clamped() {
        let mut pool = SlotPool::new(2);
        pool.release(5);
        assert_eq!(pool.available(), 2);
    }

    proptest! {
        #[test]
        fn prop_available_stays_in_bounds(
            total in 1u32..32,
            ops in proptest::collection::vec((any::<bool>(), 1u32..40), 0..200)
        ) {
            let mut pool = SlotPool::new(total);
            let mut held: Vec<u32> = Vec::new();
            for (acquire, n) in ops {
                if acquire {
                    if pool.try_acquire(n) {
                        held.push(n);
                    }
                } else if let Some(n) = held.pop() {
                    pool.release(n);
                }
                prop_assert!(pool.available() <= pool.total());
                prop_assert_eq!(pool.available() + held.iter().sum::<u32>(), total);
            }
        }
    }
}
