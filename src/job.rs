//! Image jobs: submitted source, lifecycle status and detected regions.

use crate::completion::CompletionWindow;
use crate::metrics::Timer;
use crate::protocol::{DetectedRegion, JobId};
use crate::region::{join_words, EnginePhase, RegionStateTracker};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// An image handed in by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSource {
    /// Source URL, also the duplicate-submission key
    pub src: String,
    pub width: u32,
    pub height: u32,
}

impl ImageSource {
    pub fn new(src: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            src: src.into(),
            width,
            height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    /// Apply the render scale, rounding to whole pixels
    pub fn scaled(width: u32, height: u32, scale: f64) -> Self {
        Self {
            width: (f64::from(width) * scale).round() as u32,
            height: (f64::from(height) * scale).round() as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Processing,
    Complete,
    Failed,
}

/// Protocol progress of a processing job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStage {
    Admitted,
    ChunksSent,
    RegionsKnown,
    Aggregating,
    Finalized,
}

/// Build a job id from the session, a per-session counter and the image URL.
///
/// The counter keeps re-submissions of visually similar images apart; the
/// session prefix keeps ids unique across orchestrator instances.
pub fn derive_job_id(session_id: &str, counter: u64, src: &str) -> JobId {
    let digest = Sha256::digest(src.as_bytes());
    let short_session: String = session_id.chars().take(8).collect();
    JobId(format!("{}-{}-{}", short_session, counter, &hex::encode(digest)[..12]))
}

pub struct Job<C> {
    pub id: JobId,
    pub source: ImageSource,
    pub dimensions: Dimensions,
    pub status: JobStatus,
    pub stage: JobStage,
    pub window: CompletionWindow,
    pub abandoned: bool,
    context: C,
    regions: Vec<RegionStateTracker>,
    region_index: HashMap<u64, usize>,
    timer: Option<Timer>,
}

impl<C> Job<C> {
    pub fn new(id: JobId, source: ImageSource, dimensions: Dimensions, context: C) -> Self {
        Self {
            id,
            source,
            dimensions,
            status: JobStatus::Queued,
            stage: JobStage::Admitted,
            window: CompletionWindow::default(),
            abandoned: false,
            context,
            regions: Vec::new(),
            region_index: HashMap::new(),
            timer: None,
        }
    }

    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.stage = JobStage::Admitted;
        self.timer = Some(Timer::new());
    }

    /// Consume the job, handing back the caller context for the final callback
    pub fn into_context(self) -> C {
        self.context
    }

    pub fn take_timer(&mut self) -> Option<Timer> {
        self.timer.take()
    }

    /// Register a detected region. Returns its tracker if the id is new.
    pub fn add_region(&mut self, region: DetectedRegion) -> Option<&mut RegionStateTracker> {
        if self.region_index.contains_key(&region.id) {
            return None;
        }
        let index = self.regions.len();
        self.region_index.insert(region.id, index);
        self.regions.push(RegionStateTracker::new(region));
        self.regions.get_mut(index)
    }

    pub fn region_mut(&mut self, region_id: u64) -> Option<&mut RegionStateTracker> {
        let index = *self.region_index.get(&region_id)?;
        self.regions.get_mut(index)
    }

    /// Regions in detection order
    pub fn regions(&self) -> &[RegionStateTracker] {
        &self.regions
    }

    /// Text of all finished regions in detection order, single-space separated
    pub fn aggregate_text(&self) -> String {
        join_words(
            self.regions
                .iter()
                .filter(|r| r.phase() == EnginePhase::Finished)
                .filter_map(|r| r.result()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Geometry;

    #[test]
    fn test_job_id_is_unique_per_counter() {
        let a = derive_job_id("0123456789abcdef", 1, "https://img/1.png");
        let b = derive_job_id("0123456789abcdef", 2, "https://img/1.png");
        let c = derive_job_id("0123456789abcdef", 1, "https://img/2.png");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("01234567-1-"));
        assert_eq!(a, derive_job_id("0123456789abcdef", 1, "https://img/1.png"));
    }

    #[test]
    fn test_scaled_dimensions() {
        assert_eq!(
            Dimensions::scaled(100, 51, 1.5),
            Dimensions {
                width: 150,
                height: 77
            }
        );
        assert!(Dimensions::scaled(100, 0, 2.0).is_empty());
    }

    #[test]
    fn test_regions_keep_detection_order_and_dedup() {
        let mut job = Job::new(
            JobId::from("j"),
            ImageSource::new("src", 10, 10),
            Dimensions { width: 10, height: 10 },
            (),
        );
        for id in [5, 2, 9] {
            assert!(job
                .add_region(DetectedRegion {
                    id,
                    geometry: Geometry::default()
                })
                .is_some());
        }
        assert!(job
            .add_region(DetectedRegion {
                id: 2,
                geometry: Geometry::default()
            })
            .is_none());

        let ids: Vec<u64> = job.regions().iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![5, 2, 9]);
        assert!(job.region_mut(9).is_some());
        assert!(job.region_mut(1).is_none());
        assert_eq!(job.aggregate_text(), "");
    }
}
