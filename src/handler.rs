use crate::protocol::JobId;
use tokio::sync::mpsc;

/// Receives the final outcome of every job, exactly once per job
pub trait CompletionHandler<C>: Send + 'static {
    fn on_complete(&self, job_id: JobId, text: String, context: C);

    fn on_failed(&self, job_id: JobId, reason: String, context: C);
}

/// Final outcome of one job as delivered by [`ChannelCompletionHandler`]
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<C> {
    Completed { job_id: JobId, text: String, context: C },
    Failed { job_id: JobId, reason: String, context: C },
}

impl<C> JobOutcome<C> {
    pub fn job_id(&self) -> &JobId {
        match self {
            JobOutcome::Completed { job_id, .. } => job_id,
            JobOutcome::Failed { job_id, .. } => job_id,
        }
    }

    pub fn context(&self) -> &C {
        match self {
            JobOutcome::Completed { context, .. } => context,
            JobOutcome::Failed { context, .. } => context,
        }
    }
}

/// Forwards outcomes into a channel
pub struct ChannelCompletionHandler<C> {
    tx: mpsc::UnboundedSender<JobOutcome<C>>,
}

impl<C> ChannelCompletionHandler<C> {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobOutcome<C>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn deliver(&self, outcome: JobOutcome<C>) {
        if self.tx.send(outcome).is_err() {
            tracing::warn!("Outcome receiver dropped, discarding job outcome");
        }
    }
}

impl<C: Send + 'static> CompletionHandler<C> for ChannelCompletionHandler<C> {
    fn on_complete(&self, job_id: JobId, text: String, context: C) {
        self.deliver(JobOutcome::Completed { job_id, text, context });
    }

    fn on_failed(&self, job_id: JobId, reason: String, context: C) {
        self.deliver(JobOutcome::Failed { job_id, reason, context });
    }
}
