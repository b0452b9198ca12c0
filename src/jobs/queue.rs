//! Admission queue
//!
//! Ordered by (priority, submission sequence): lower priority numbers first,
//! FIFO within a priority. Once the longest-waiting job has waited past the
//! aging threshold, capacity is reserved for it: nothing else is admitted
//! until it fits.

use crate::jobs::job::JobId;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEntry {
    pub job_id: JobId,
    pub priority: u8,
    pub seq: u64,
    pub slots: u32,
    pub enqueued_at: Instant,
}

#[derive(Debug, Default)]
pub struct AdmissionQueue {
    by_priority: BTreeMap<(u8, u64), QueuedEntry>,
    by_seq: BTreeMap<u64, u8>,
    index: HashMap<JobId, (u8, u64)>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_priority.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_priority.is_empty()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.index.contains_key(job_id)
    }

    pub fn push(&mut self, entry: QueuedEntry) {
        let key = (entry.priority, entry.seq);
        self.index.insert(entry.job_id.clone(), key);
        self.by_seq.insert(entry.seq, entry.priority);
        self.by_priority.insert(key, entry);
    }

    pub fn remove(&mut self, job_id: &str) -> Option<QueuedEntry> {
        let key = self.index.remove(job_id)?;
        self.by_seq.remove(&key.1);
        self.by_priority.remove(&key)
    }

    /// Longest-waiting entry
    pub fn oldest(&self) -> Option<&QueuedEntry> {
        let (seq, priority) = self.by_seq.iter().next()?;
        self.by_priority.get(&(*priority, *seq))
    }

    /// Next entry to admit with `available` free slots, without removing it
    pub fn peek_admissible(
        &self,
        available: u32,
        now: Instant,
        aging_threshold: Duration,
    ) -> Option<&QueuedEntry> {
        if let Some(oldest) = self.oldest() {
            if now.saturating_duration_since(oldest.enqueued_at) >= aging_threshold {
                return (oldest.slots <= available).then_some(oldest);
            }
        }
        self.by_priority.values().find(|e| e.slots <= available)
    }

    /// Remove and return the next entry to admit
    pub fn pop_admissible(
        &mut self,
        available: u32,
        now: Instant,
        aging_threshold: Duration,
    ) -> Option<QueuedEntry> {
        let job_id = self
            .peek_admissible(available, now, aging_threshold)?
            .job_id
            .clone();
        self.remove(&job_id)
    }

    /// Remove every entry, oldest first
    pub fn drain(&mut self) -> Vec<QueuedEntry> {
        let mut entries: Vec<QueuedEntry> =
            std::mem::take(&mut self.by_priority).into_values().collect();
        entries.sort_by_key(|e| e.seq);
        self.by_seq.clear();
        self.index.clear();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const AGING: Duration = Duration::from_secs(30);

    fn entry(id: &str, priority: u8, seq: u64, slots: u32, at: Instant) -> QueuedEntry {
        QueuedEntry {
            job_id: id.to_string(),
            priority,
            seq,
            slots,
            enqueued_at: at,
        }
    }

    #[test]
    fn test_priority_then_fifo() {
        let now = Instant::now();
        let mut queue = AdmissionQueue::new();
        queue.push(entry("low", 3, 1, 1, now));
        queue.push(entry("high-b", 1, 3, 1, now));
        queue.push(entry("high-a", 1, 2, 1, now));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop_admissible(10, now, AGING))
            .map(|e| e.job_id)
            .collect();
        assert_eq!(order, vec!["high-a", "high-b", "low"]);
    }

    #[test]
    fn test_skips_jobs_that_do_not_fit() {
        let now = Instant::now();
        let mut queue = AdmissionQueue::new();
        queue.push(entry("big", 1, 1, 8, now));
        queue.push(entry("small", 2, 2, 2, now));

        assert_eq!(queue.pop_admissible(4, now, AGING).unwrap().job_id, "small");
        assert!(queue.pop_admissible(4, now, AGING).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_aged_job_reserves_capacity() {
        let start = Instant::now();
        let later = start + Duration::from_secs(31);
        let mut queue = AdmissionQueue::new();
        queue.push(entry("starved", 5, 1, 6, start));
        queue.push(entry("urgent", 1, 2, 2, start + Duration::from_secs(29)));

        // Before the threshold the urgent small job wins
        assert_eq!(
            queue.peek_admissible(4, start + Duration::from_secs(29), AGING).unwrap().job_id,
            "urgent"
        );
        // After it, nothing runs until the starved job fits
        assert!(queue.peek_admissible(4, later, AGING).is_none());
        assert_eq!(queue.pop_admissible(6, later, AGING).unwrap().job_id, "starved");
        assert_eq!(queue.pop_admissible(6, later, AGING).unwrap().job_id, "urgent");
    }

    #[test]
    fn test_remove_and_drain() {
        let now = Instant::now();
        let mut queue = AdmissionQueue::new();
        queue.push(entry("a", 2, 1, 1, now));
        queue.push(entry("b", 1, 2, 1, now));
        queue.push(entry("c", 1, 3, 1, now));
        assert!(queue.remove("b").is_some());
        assert!(queue.remove("b").is_none());
        assert!(!queue.contains("b"));
        assert_eq!(queue.oldest().unwrap().job_id, "a");

        let drained: Vec<String> = queue.drain().into_iter().map(|e| e.job_id).collect();
        assert_eq!(drained, vec!["a", "c"]);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_admitted_entry_always_fits(
            jobs in proptest::collection::vec((1u8..=5, 1u32..10), 1..50),
            available in 0u32..10,
        ) {
            let now = Instant::now();
            let mut queue = AdmissionQueue::new();
            for (seq, (priority, slots)) in jobs.iter().enumerate() {
                queue.push(entry(&format!("j{}", seq), *priority, seq as u64, *slots, now));
            }
            if let Some(admitted) = queue.pop_admissible(available, now, AGING) {
                prop_assert!(admitted.slots <= available);
                // No fitting entry ordered before it was skipped
                for (priority, slots) in jobs.iter() {
                    if *slots <= available {
                        prop_assert!(*priority >= admitted.priority);
                    }
                }
            } else {
                prop_assert!(jobs.iter().all(|(_, s)| *s > available));
            }
        }
    }
}
