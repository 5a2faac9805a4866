//! Quiet-period timers that decide when a job is complete.
//!
//! Each touch re-arms the job's timer under a new generation. A firing
//! carries its generation, so one that was superseded while in flight is
//! recognised and ignored.

use crate::protocol::JobId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Emitted when a job has been quiet for its whole window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionFired {
    pub job_id: JobId,
    pub generation: u64,
}

/// Per-job finalization state, owned by the job itself
#[derive(Debug, Clone, Default)]
pub struct CompletionWindow {
    pub last_activity_at: Option<Instant>,
    pub generation: u64,
    pub fired: bool,
}

impl CompletionWindow {
    /// Record activity and the generation of the timer it armed
    pub fn touched(&mut self, generation: u64) {
        self.last_activity_at = Some(Instant::now());
        self.generation = generation;
    }

    /// Claim finalization for a firing. True exactly once, and only for the
    /// most recently armed timer.
    pub fn try_fire(&mut self, generation: u64) -> bool {
        if self.fired || generation != self.generation {
            return false;
        }
        self.fired = true;
        true
    }
}

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Quiet-period timers keyed by job id.
///
/// `touch` cancels any pending timer for the job and arms a new one. When a
/// timer runs out it sends a [`CompletionFired`] carrying the generation it
/// was armed with, so a firing that raced with a later `touch` can be told
/// apart from the current one.
pub struct CompletionDetector {
    quiet_period: Duration,
    next_generation: u64,
    slots: HashMap<JobId, Slot>,
    tx: mpsc::UnboundedSender<CompletionFired>,
}

impl CompletionDetector {
    pub fn new(quiet_period: Duration) -> (Self, mpsc::UnboundedReceiver<CompletionFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                quiet_period,
                next_generation: 0,
                slots: HashMap::new(),
                tx,
            },
            rx,
        )
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Restart the quiet period for `job_id`. Returns the new generation.
    pub fn touch(&mut self, job_id: &JobId) -> u64 {
        self.touch_after(job_id, self.quiet_period)
    }

    /// Arm the job's timer with an explicit window
    pub fn touch_after(&mut self, job_id: &JobId, window: Duration) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;

        let tx = self.tx.clone();
        let fired = CompletionFired {
            job_id: job_id.clone(),
            generation,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(fired);
        });

        if let Some(previous) = self.slots.insert(job_id.clone(), Slot { generation, handle }) {
            previous.handle.abort();
        }
        generation
    }

    /// Drop the job's timer, if any
    pub fn cancel(&mut self, job_id: &JobId) {
        if let Some(slot) = self.slots.remove(job_id) {
            slot.handle.abort();
        }
    }

    /// Forget a timer that has fired, leaving newer timers untouched
    pub fn clear_fired(&mut self, fired: &CompletionFired) {
        if self
            .slots
            .get(&fired.job_id)
            .is_some_and(|slot| slot.generation == fired.generation)
        {
            self.slots.remove(&fired.job_id);
        }
    }

    pub fn armed(&self) -> usize {
        self.slots.len()
    }

    pub fn cancel_all(&mut self) {
        for (_, slot) in self.slots.drain() {
            slot.handle.abort();
        }
    }
}

impl Drop for CompletionDetector {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
