//! Serial image OCR orchestrator.
//!
//! One task owns all job and region state. It admits one image at a time,
//! asks the backend to segment it, fans out one recognition request per
//! detected region and declares the image done once no region event has
//! arrived for the quiet period. Commands from callers, inbound backend
//! events and timer firings are all handled on that task, one at a time.

use crate::chunk::plan_chunks;
use crate::completion::{CompletionDetector, CompletionFired};
use crate::config::OcrConfig;
use crate::error::{OcrError, Result};
use crate::handler::CompletionHandler;
use crate::job::{derive_job_id, Dimensions, ImageSource, Job, JobStage, JobStatus};
use crate::metrics;
use crate::outbound::OutboundQueue;
use crate::protocol::{DetectedRegion, InboundEvent, JobId, OutboundMessage, RecognitionPayload};
use crate::queue::{ImageJobQueue, RecentSet};
use crate::region::{GlyphLookup, NoLookupCache, ResultOutcome};
use crate::transport::Transport;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const REASON_ABANDONED: &str = "abandoned";
pub const REASON_SHUTDOWN: &str = "orchestrator shut down";

/// Requests served by the orchestrator task
pub enum Command<C> {
    Submit {
        image: ImageSource,
        context: C,
        reply: oneshot::Sender<Result<JobId>>,
    },
    Abandon {
        job_id: JobId,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<OrchestratorStats>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorStats {
    pub queued: usize,
    pub active: Option<JobId>,
    pub tracked_jobs: usize,
    pub outbound_depth: usize,
    pub armed_timers: usize,
    /// Sources currently rejected as duplicates
    pub submission_markers: usize,
}

enum Finalization {
    Complete,
    Failed(String),
}

pub struct Orchestrator<C, H> {
    config: OcrConfig,
    session_id: String,
    counter: u64,
    jobs: HashMap<JobId, Job<C>>,
    /// Sources of queued and processing jobs
    live_sources: HashSet<String>,
    /// Sources of recently finished jobs
    finished_sources: RecentSet<String>,
    finalized: RecentSet<JobId>,
    queue: ImageJobQueue,
    outbound: OutboundQueue,
    completion: CompletionDetector,
    timers: mpsc::UnboundedReceiver<CompletionFired>,
    lookup: Box<dyn GlyphLookup>,
    handler: H,
}

impl<C, H> Orchestrator<C, H>
where
    C: Send + 'static,
    H: CompletionHandler<C>,
{
    /// Create an orchestrator. Must be called from within a tokio runtime,
    /// since the outbound drain task is spawned here.
    pub fn new<T: Transport>(config: OcrConfig, transport: Arc<T>, handler: H) -> Result<Self> {
        config.validate()?;

        let outbound = OutboundQueue::spawn(transport, config.send_interval());
        let (completion, timers) = CompletionDetector::new(config.quiet_period());
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let finished_sources = RecentSet::new(config.submission_history);
        let finalized = RecentSet::new(config.finalized_history);

        info!(
            session_id = %session_id,
            quiet_period_ms = config.quiet_period_ms,
            send_interval_ms = config.send_interval_ms,
            "OCR orchestrator created"
        );

        Ok(Self {
            config,
            session_id,
            counter: 0,
            jobs: HashMap::new(),
            live_sources: HashSet::new(),
            finished_sources,
            finalized,
            queue: ImageJobQueue::new(),
            outbound,
            completion,
            timers,
            lookup: Box::new(NoLookupCache),
            handler,
        })
    }

    /// Replace the glyph lookup hook consulted when assigning engines
    pub fn with_lookup(mut self, lookup: impl GlyphLookup + 'static) -> Self {
        self.lookup = Box::new(lookup);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &OcrConfig {
        &self.config
    }

    /// Queue an image. Rejects a source that is queued, processing or
    /// among the recently finished ones.
    pub fn submit(&mut self, image: ImageSource, context: C) -> Result<JobId> {
        if self.live_sources.contains(&image.src) || self.finished_sources.contains(&image.src) {
            metrics::DUPLICATE_SUBMISSIONS.inc();
            debug!(src = %image.src, "Rejecting duplicate image submission");
            return Err(OcrError::DuplicateSubmission { src: image.src });
        }

        self.counter += 1;
        let job_id = derive_job_id(&self.session_id, self.counter, &image.src);
        let dimensions = Dimensions::scaled(image.width, image.height, self.config.render_scale);

        self.live_sources.insert(image.src.clone());
        info!(
            job_id = %job_id,
            src = %image.src,
            width = dimensions.width,
            height = dimensions.height,
            "Queued image for OCR"
        );
        self.jobs
            .insert(job_id.clone(), Job::new(job_id.clone(), image, dimensions, context));
        self.queue.enqueue(job_id.clone());
        metrics::JOBS_SUBMITTED.inc();

        self.start_next();
        Ok(job_id)
    }

    /// Give up on a job. A queued job fails right away; a processing job is
    /// reported as failed once its completion timer runs out.
    pub fn abandon(&mut self, job_id: &JobId) -> bool {
        let Some(status) = self.jobs.get(job_id).map(|job| job.status) else {
            return false;
        };

        match status {
            JobStatus::Queued => {
                self.queue.remove(job_id);
                self.finalize(job_id, Finalization::Failed(REASON_ABANDONED.to_string()));
                metrics::QUEUE_DEPTH.set(self.queue.len() as i64);
                true
            }
            JobStatus::Processing => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    info!(job_id = %job_id, "Abandoning job, waiting for its timer to release the queue");
                    job.abandoned = true;
                }
                true
            }
            JobStatus::Complete | JobStatus::Failed => false,
        }
    }

    /// Route one inbound backend event
    pub fn handle_event(&mut self, event: InboundEvent) {
        let job_id = event.job_id().clone();

        let Some(job) = self.jobs.get_mut(&job_id) else {
            if self.finalized.contains(&job_id) {
                debug!(job_id = %job_id, "Dropping event for finalized job");
                metrics::record_dropped("finalized_job");
            } else {
                debug!(job_id = %job_id, "Dropping event for unknown job");
                metrics::record_dropped("unknown_job");
            }
            return;
        };

        if job.status != JobStatus::Processing {
            debug!(job_id = %job_id, status = ?job.status, "Dropping event for job that is not processing");
            metrics::record_dropped("not_processing");
            return;
        }

        let accepted = match event {
            InboundEvent::RegionsDetected { regions, .. } => self.on_regions_detected(&job_id, regions),
            InboundEvent::Recognized {
                region_id,
                engine,
                result,
                ..
            } => self.on_recognized(&job_id, region_id, &engine, result),
        };

        if accepted {
            let generation = self.completion.touch(&job_id);
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.window.touched(generation);
            }
        }
    }

    fn on_regions_detected(&mut self, job_id: &JobId, regions: Vec<DetectedRegion>) -> bool {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if job.stage == JobStage::ChunksSent {
            job.stage = JobStage::RegionsKnown;
        }

        let reported = regions.len();
        let mut added = 0usize;
        for region in regions {
            let Some(tracker) = job.add_region(region) else {
                continue;
            };
            added += 1;
            if tracker.assign_engine(job_id, self.lookup.as_ref(), &self.config.default_engine) {
                debug!(job_id = %job_id, region_id = tracker.id(), "Region served from glyph lookup");
                continue;
            }
            if let Err(e) = tracker.begin_recognition(job_id, self.config.render_scale, &self.outbound) {
                warn!(job_id = %job_id, region_id = tracker.id(), "Failed to request recognition: {}", e);
            }
        }
        metrics::REGIONS_DETECTED.inc_by(added as u64);

        if added > 0 {
            job.stage = JobStage::Aggregating;
            info!(job_id = %job_id, reported, added, total = job.regions().len(), "Regions detected");
            true
        } else if job.regions().is_empty() {
            info!(job_id = %job_id, "No regions detected, waiting out the quiet period");
            true
        } else {
            debug!(job_id = %job_id, reported, "Detection event brought no new regions");
            metrics::record_dropped("duplicate_detection");
            false
        }
    }

    fn on_recognized(&mut self, job_id: &JobId, region_id: u64, engine: &str, result: RecognitionPayload) -> bool {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        let Some(tracker) = job.region_mut(region_id) else {
            debug!(job_id = %job_id, region_id, "Dropping result for unknown region");
            metrics::record_dropped("unknown_region");
            return false;
        };

        let outcome = tracker.on_result(result, engine);
        match &outcome {
            ResultOutcome::Finished => {
                debug!(job_id = %job_id, region_id, engine, "Region recognized");
            }
            ResultOutcome::Errored { reason } => {
                warn!(
                    job_id = %job_id,
                    region_id,
                    engine,
                    diagnostics = tracker.diagnostics().unwrap_or_default(),
                    "Region recognition failed: {}",
                    reason
                );
                metrics::REGIONS_ERRORED.inc();
            }
            ResultOutcome::IgnoredStaleEngine { expected, reported } => {
                debug!(job_id = %job_id, region_id, %expected, %reported, "Dropping result from superseded engine");
                metrics::record_dropped("stale_engine");
            }
            ResultOutcome::IgnoredTerminal => {
                debug!(job_id = %job_id, region_id, "Dropping duplicate result");
                metrics::record_dropped("duplicate_result");
            }
        }
        outcome.is_accepted()
    }

    /// Handle a completion timer. Finalizes the job if the firing is for its
    /// most recent timer and it has not been finalized yet.
    pub fn on_completion_fired(&mut self, fired: CompletionFired) {
        self.completion.clear_fired(&fired);

        let Some(job) = self.jobs.get_mut(&fired.job_id) else {
            debug!(job_id = %fired.job_id, "Completion timer for job that is gone");
            return;
        };
        if !job.window.try_fire(fired.generation) {
            debug!(job_id = %fired.job_id, generation = fired.generation, "Ignoring superseded completion timer");
            return;
        }

        let outcome = if job.abandoned {
            Finalization::Failed(REASON_ABANDONED.to_string())
        } else {
            Finalization::Complete
        };
        let next = self.finalize(&fired.job_id, outcome);
        self.drive_admissions(next);
    }

    /// Wait for the next completion timer. Only needed when driving the
    /// orchestrator by hand instead of through [`Orchestrator::start`].
    pub async fn next_completion(&mut self) -> Option<CompletionFired> {
        self.timers.recv().await
    }

    pub fn job_status(&self, job_id: &JobId) -> Option<JobStatus> {
        self.jobs.get(job_id).map(|job| job.status)
    }

    pub fn job(&self, job_id: &JobId) -> Option<&Job<C>> {
        self.jobs.get(job_id)
    }

    pub fn stats(&self) -> OrchestratorStats {
        OrchestratorStats {
            queued: self.queue.len(),
            active: self.queue.active().cloned(),
            tracked_jobs: self.jobs.len(),
            outbound_depth: self.outbound.depth(),
            armed_timers: self.completion.armed(),
            submission_markers: self.live_sources.len() + self.finished_sources.len(),
        }
    }

    /// Fail every queued and active job and stop all timers
    pub fn shutdown(&mut self) {
        self.completion.cancel_all();

        let active = self.queue.active().cloned();
        let pending = self.queue.drain_pending();
        let count = pending.len() + usize::from(active.is_some());
        for job_id in active.into_iter().chain(pending) {
            self.finalize(&job_id, Finalization::Failed(REASON_SHUTDOWN.to_string()));
        }
        metrics::QUEUE_DEPTH.set(0);

        if count > 0 {
            info!(failed = count, "Orchestrator shut down with unfinished jobs");
        }
    }

    fn start_next(&mut self) {
        if self.queue.is_idle() {
            let next = self.queue.admit_next();
            self.drive_admissions(next);
        }
        metrics::QUEUE_DEPTH.set(self.queue.len() as i64);
    }

    /// Admit jobs until one is waiting on the backend or the queue is empty
    fn drive_admissions(&mut self, mut next: Option<JobId>) {
        while let Some(job_id) = next {
            match self.admit(&job_id) {
                Ok(()) => break,
                Err(reason) => {
                    warn!(job_id = %job_id, "Failed to start OCR: {}", reason);
                    next = self.finalize(&job_id, Finalization::Failed(reason));
                }
            }
        }
        metrics::QUEUE_DEPTH.set(self.queue.len() as i64);
    }

    fn admit(&mut self, job_id: &JobId) -> std::result::Result<(), String> {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return Err("job state missing".to_string());
        };
        job.mark_processing();

        if job.dimensions.is_empty() {
            return Err(format!(
                "image has no area after scaling ({}x{})",
                job.dimensions.width, job.dimensions.height
            ));
        }

        let chunks = plan_chunks(job.dimensions.height, self.config.chunk_size, self.config.chunk_overlap);
        let chunk_count = chunks.len();
        self.outbound
            .push(OutboundMessage::ChunkRequest {
                job_id: job_id.clone(),
                src: job.source.src.clone(),
                width: job.dimensions.width,
                height: job.dimensions.height,
                chunks,
                scale: self.config.render_scale,
            })
            .map_err(|e| e.to_string())?;
        job.stage = JobStage::ChunksSent;

        let generation = self.completion.touch_after(job_id, self.config.detection_grace());
        job.window.touched(generation);

        info!(job_id = %job_id, chunks = chunk_count, "Started OCR for image");
        Ok(())
    }

    /// Remove a job, report its outcome and release the queue slot if it
    /// held it. Returns the next admitted job, if any.
    fn finalize(&mut self, job_id: &JobId, outcome: Finalization) -> Option<JobId> {
        self.completion.cancel(job_id);
        let was_active = self.queue.active() == Some(job_id);

        if let Some(mut job) = self.jobs.remove(job_id) {
            job.stage = JobStage::Finalized;
            job.window.fired = true;
            if let Some(timer) = job.take_timer() {
                timer.observe_duration_seconds(&metrics::JOB_DURATION);
            }
            self.finalized.insert(job_id.clone());
            self.live_sources.remove(&job.source.src);
            self.finished_sources.insert(job.source.src.clone());

            match outcome {
                Finalization::Complete => {
                    job.status = JobStatus::Complete;
                    let text = job.aggregate_text();
                    info!(
                        job_id = %job_id,
                        regions = job.regions().len(),
                        chars = text.len(),
                        "OCR complete"
                    );
                    metrics::JOBS_COMPLETED.inc();
                    self.handler.on_complete(job_id.clone(), text, job.into_context());
                }
                Finalization::Failed(reason) => {
                    job.status = JobStatus::Failed;
                    info!(job_id = %job_id, reason = %reason, "OCR failed");
                    metrics::JOBS_FAILED.inc();
                    self.handler.on_failed(job_id.clone(), reason, job.into_context());
                }
            }
        }

        if was_active {
            self.queue.on_job_finalized(job_id)
        } else {
            None
        }
    }

    /// Spawn the orchestrator task and return a handle to talk to it
    pub fn start(self, inbound: mpsc::UnboundedReceiver<InboundEvent>) -> (OcrHandle<C>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx, inbound));
        (OcrHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<C>>,
        mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
    ) {
        info!(session_id = %self.session_id, "OCR orchestrator started");
        let mut inbound_open = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Submit { image, context, reply }) => {
                        let _ = reply.send(self.submit(image, context));
                    }
                    Some(Command::Abandon { job_id, reply }) => {
                        let _ = reply.send(self.abandon(&job_id));
                    }
                    Some(Command::Stats { reply }) => {
                        let _ = reply.send(self.stats());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                event = inbound.recv(), if inbound_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Inbound event stream closed");
                        inbound_open = false;
                    }
                },
                Some(fired) = self.timers.recv() => self.on_completion_fired(fired),
            }
        }

        self.shutdown();
        info!(session_id = %self.session_id, "OCR orchestrator stopped");
    }
}

/// Cloneable handle to a running orchestrator
pub struct OcrHandle<C> {
    tx: mpsc::UnboundedSender<Command<C>>,
}

impl<C> Clone for OcrHandle<C> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<C> OcrHandle<C> {
    /// Submit an image with its caller context
    pub async fn submit(&self, image: ImageSource, context: C) -> Result<JobId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit { image, context, reply })
            .map_err(|_| OcrError::Stopped)?;
        rx.await.map_err(|_| OcrError::Stopped)?
    }

    pub async fn abandon(&self, job_id: JobId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Abandon { job_id, reply })
            .map_err(|_| OcrError::Stopped)?;
        rx.await.map_err(|_| OcrError::Stopped)
    }

    pub async fn stats(&self) -> Result<OrchestratorStats> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Stats { reply }).map_err(|_| OcrError::Stopped)?;
        rx.await.map_err(|_| OcrError::Stopped)
    }

    /// Ask the orchestrator to stop; unfinished jobs are reported as failed
    pub fn shutdown(&self) -> Result<()> {
        self.tx.send(Command::Shutdown).map_err(|_| OcrError::Stopped)
    }
}
