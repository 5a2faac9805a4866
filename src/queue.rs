//! Admission bookkeeping: the serial image queue and bounded id histories.

use crate::protocol::JobId;
use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

/// FIFO admission control: at most one job is active at a time.
///
/// The queue only holds ids; job state lives with the orchestrator.
#[derive(Debug, Default)]
pub struct ImageJobQueue {
    pending: VecDeque<JobId>,
    queued: HashSet<JobId>,
    active: Option<JobId>,
}

impl ImageJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail. Returns false if the id is already queued or active.
    pub fn enqueue(&mut self, job_id: JobId) -> bool {
        if self.active.as_ref() == Some(&job_id) || self.queued.contains(&job_id) {
            tracing::debug!(job_id = %job_id, "Job already queued or active, ignoring");
            return false;
        }
        self.queued.insert(job_id.clone());
        self.pending.push_back(job_id);
        true
    }

    /// Pop the head and make it active. Returns `None` while a job is
    /// active or when nothing is waiting.
    pub fn admit_next(&mut self) -> Option<JobId> {
        if self.active.is_some() {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.queued.remove(&next);
        self.active = Some(next.clone());
        Some(next)
    }

    /// Release the active slot and admit the next job, if any.
    ///
    /// A call for a job that is not the active one leaves the slot alone.
    pub fn on_job_finalized(&mut self, job_id: &JobId) -> Option<JobId> {
        if self.active.as_ref() == Some(job_id) {
            self.active = None;
        } else {
            tracing::warn!(job_id = %job_id, "Finalized job was not the active one");
        }
        self.admit_next()
    }

    /// Drop a job that has not been admitted yet
    pub fn remove(&mut self, job_id: &JobId) -> bool {
        if !self.queued.remove(job_id) {
            return false;
        }
        self.pending.retain(|id| id != job_id);
        true
    }

    pub fn active(&self) -> Option<&JobId> {
        self.active.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every waiting id, leaving the active slot untouched
    pub fn drain_pending(&mut self) -> Vec<JobId> {
        self.queued.clear();
        self.pending.drain(..).collect()
    }
}

/// Insertion-ordered set that forgets its oldest entries past `capacity`
#[derive(Debug)]
pub struct RecentSet<T> {
    order: VecDeque<T>,
    members: HashSet<T>,
    capacity: usize,
}

impl<T: Clone + Eq + Hash> RecentSet<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    /// Remember a value, evicting the oldest ones over capacity
    pub fn insert(&mut self, value: T) {
        if !self.members.insert(value.clone()) {
            return;
        }
        self.order.push_back(value);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.members.remove(&old);
            }
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.members.contains(value)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> JobId {
        JobId::from(s)
    }

    #[test]
    fn test_fifo_single_active() {
        let mut queue = ImageJobQueue::new();
        assert!(queue.enqueue(id("a")));
        assert!(queue.enqueue(id("b")));

        assert_eq!(queue.admit_next(), Some(id("a")));
        // Busy until "a" finalizes
        assert_eq!(queue.admit_next(), None);
        assert_eq!(queue.active(), Some(&id("a")));
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.on_job_finalized(&id("a")), Some(id("b")));
        assert_eq!(queue.on_job_finalized(&id("b")), None);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let mut queue = ImageJobQueue::new();
        assert!(queue.enqueue(id("a")));
        assert!(!queue.enqueue(id("a")));
        queue.admit_next();
        assert!(!queue.enqueue(id("a")));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_finalizing_wrong_job_keeps_active() {
        let mut queue = ImageJobQueue::new();
        queue.enqueue(id("a"));
        queue.enqueue(id("b"));
        queue.admit_next();
        assert_eq!(queue.on_job_finalized(&id("zzz")), None);
        assert_eq!(queue.active(), Some(&id("a")));
    }

    #[test]
    fn test_remove_pending() {
        let mut queue = ImageJobQueue::new();
        queue.enqueue(id("a"));
        queue.enqueue(id("b"));
        queue.enqueue(id("c"));
        assert!(queue.remove(&id("b")));
        assert!(!queue.remove(&id("b")));
        assert_eq!(queue.admit_next(), Some(id("a")));
        assert_eq!(queue.on_job_finalized(&id("a")), Some(id("c")));
    }

    #[test]
    fn test_recent_set_evicts_oldest() {
        let mut recent = RecentSet::new(2);
        recent.insert("a");
        recent.insert("b");
        recent.insert("a");
        assert_eq!(recent.len(), 2);

        recent.insert("c");
        assert!(!recent.contains(&"a"));
        assert!(recent.contains(&"b"));
        assert!(recent.contains(&"c"));
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn test_recent_set_with_zero_capacity_keeps_nothing() {
        let mut recent = RecentSet::new(0);
        recent.insert(id("a"));
        assert!(recent.is_empty());
        assert!(!recent.contains(&id("a")));
    }
}
