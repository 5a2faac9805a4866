//! Per-region recognition state.
//!
//! Each detected region walks `Idle -> AwaitingResult -> Finished | Error`
//! for the engine currently assigned to it. Results for another engine or
//! for an already terminal region are ignored, which makes the tracker safe
//! against duplicated and late backend responses.

use crate::error::Result;
use crate::outbound::OutboundQueue;
use crate::protocol::{DetectedRegion, Geometry, JobId, OutboundMessage, RawBlock, RecognitionPayload};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnginePhase {
    Idle,
    AwaitingResult,
    Finished,
    Error,
}

impl EnginePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, EnginePhase::Finished | EnginePhase::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineState {
    pub engine: String,
    pub phase: EnginePhase,
}

/// A recognized block translated back into image coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
    pub geometry: Geometry,
}

/// Text recognized earlier for a region with a given engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupHit {
    pub text: String,
}

/// Source of pre-recognized glyph chunks for a region.
///
/// A hit for the assigned engine finishes the region with the stored text
/// and no recognition request is sent for it. No cache is wired up yet, so
/// the default implementation always misses.
pub trait GlyphLookup: Send + Sync {
    fn lookup(&self, job_id: &JobId, region: &DetectedRegion, engine: &str) -> Option<LookupHit>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoLookupCache;

impl GlyphLookup for NoLookupCache {
    fn lookup(&self, _job_id: &JobId, _region: &DetectedRegion, _engine: &str) -> Option<LookupHit> {
        None
    }
}

/// What `on_result` did with an inbound result
#[derive(Debug, Clone, PartialEq)]
pub enum ResultOutcome {
    Finished,
    Errored { reason: String },
    IgnoredStaleEngine { expected: String, reported: String },
    IgnoredTerminal,
}

impl ResultOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ResultOutcome::Finished | ResultOutcome::Errored { .. })
    }
}

#[derive(Debug)]
pub struct RegionStateTracker {
    region: DetectedRegion,
    state: EngineState,
    requested_engines: HashSet<String>,
    processing_started_at: Option<Instant>,
    result: Option<String>,
    blocks: Vec<TextBlock>,
    diagnostics: Option<String>,
}

impl RegionStateTracker {
    pub fn new(region: DetectedRegion) -> Self {
        Self {
            region,
            state: EngineState {
                engine: String::new(),
                phase: EnginePhase::Idle,
            },
            requested_engines: HashSet::new(),
            processing_started_at: None,
            result: None,
            blocks: Vec::new(),
            diagnostics: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.region.id
    }

    pub fn geometry(&self) -> Geometry {
        self.region.geometry
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn phase(&self) -> EnginePhase {
        self.state.phase
    }

    /// Recognized text, present only once the region is `Finished`
    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn blocks(&self) -> &[TextBlock] {
        &self.blocks
    }

    /// Raw backend output kept for a region that ended in `Error`
    pub fn diagnostics(&self) -> Option<&str> {
        self.diagnostics.as_deref()
    }

    pub fn processing_started_at(&self) -> Option<Instant> {
        self.processing_started_at
    }

    /// Assign `engine` to this region and consult the lookup for it.
    ///
    /// Returns true if the lookup finished the region, in which case no live
    /// recognition is needed.
    pub fn assign_engine(&mut self, job_id: &JobId, lookup: &dyn GlyphLookup, engine: &str) -> bool {
        if self.state.phase.is_terminal() {
            return false;
        }

        if engine != self.state.engine {
            if self.state.phase == EnginePhase::AwaitingResult {
                tracing::debug!(
                    job_id = %job_id,
                    region_id = self.region.id,
                    from = %self.state.engine,
                    to = %engine,
                    "Engine changed, discarding in-flight recognition"
                );
            }
            self.state = EngineState {
                engine: engine.to_string(),
                phase: EnginePhase::Idle,
            };
            self.processing_started_at = None;
        }

        let Some(hit) = lookup.lookup(job_id, &self.region, &self.state.engine) else {
            return false;
        };
        self.result = Some(hit.text.trim().to_string());
        self.state.phase = EnginePhase::Finished;
        self.processing_started_at = None;
        true
    }

    /// Request recognition with the assigned engine.
    ///
    /// Returns `Ok(false)` without sending when a request for this engine is
    /// already in flight or was made before.
    pub fn begin_recognition(&mut self, job_id: &JobId, scale: f64, outbound: &OutboundQueue) -> Result<bool> {
        if matches!(self.state.phase, EnginePhase::AwaitingResult | EnginePhase::Finished)
            || self.requested_engines.contains(&self.state.engine)
        {
            return Ok(false);
        }

        outbound.push(OutboundMessage::RecognizeRequest {
            job_id: job_id.clone(),
            region_id: self.region.id,
            engine: self.state.engine.clone(),
            geometry: self.region.geometry,
            scale,
        })?;

        self.requested_engines.insert(self.state.engine.clone());
        self.state.phase = EnginePhase::AwaitingResult;
        self.processing_started_at = Some(Instant::now());
        Ok(true)
    }

    pub fn on_result(&mut self, payload: RecognitionPayload, reported_engine: &str) -> ResultOutcome {
        if reported_engine != self.state.engine {
            return ResultOutcome::IgnoredStaleEngine {
                expected: self.state.engine.clone(),
                reported: reported_engine.to_string(),
            };
        }
        if self.state.phase.is_terminal() {
            return ResultOutcome::IgnoredTerminal;
        }

        if let Some(error) = payload.error {
            self.fail(payload.text);
            return ResultOutcome::Errored { reason: error };
        }

        match normalize_blocks(&self.region.geometry, &payload.blocks) {
            Some(blocks) => {
                let text = if blocks.is_empty() {
                    payload.text.trim().to_string()
                } else {
                    join_words(blocks.iter().map(|b| b.text.as_str()))
                };
                self.blocks = blocks;
                self.result = Some(text);
                self.state.phase = EnginePhase::Finished;
                ResultOutcome::Finished
            }
            None => {
                let raw = if payload.text.is_empty() {
                    join_words(payload.blocks.iter().map(|b| b.text.as_str()))
                } else {
                    payload.text
                };
                self.fail(raw);
                ResultOutcome::Errored {
                    reason: "non-finite block coordinate".to_string(),
                }
            }
        }
    }

    fn fail(&mut self, raw: String) {
        self.state.phase = EnginePhase::Error;
        self.result = None;
        self.diagnostics = Some(raw);
    }
}

/// Join non-empty, trimmed pieces with single spaces
pub fn join_words<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Map engine-space blocks back to image space.
///
/// Each block is scaled back by its transform, rotated back around the
/// region centre and offset by the region origin. Returns `None` if any
/// coordinate is not finite.
fn normalize_blocks(region: &Geometry, blocks: &[RawBlock]) -> Option<Vec<TextBlock>> {
    let cx = region.width / 2.0;
    let cy = region.height / 2.0;

    blocks
        .iter()
        .map(|block| {
            let scale = block.transform.scale;
            let theta = -block.transform.rotation_deg.to_radians();
            let (sin, cos) = theta.sin_cos();

            let corners = [
                (block.x0, block.y0),
                (block.x1, block.y0),
                (block.x0, block.y1),
                (block.x1, block.y1),
            ];

            let mut min_x = f64::INFINITY;
            let mut min_y = f64::INFINITY;
            let mut max_x = f64::NEG_INFINITY;
            let mut max_y = f64::NEG_INFINITY;
            for (x, y) in corners {
                let (x, y) = (x / scale - cx, y / scale - cy);
                let rx = x * cos - y * sin + cx;
                let ry = x * sin + y * cos + cy;
                if !rx.is_finite() || !ry.is_finite() {
                    return None;
                }
                min_x = min_x.min(rx);
                min_y = min_y.min(ry);
                max_x = max_x.max(rx);
                max_y = max_y.max(ry);
            }

            let geometry = Geometry::new(region.x + min_x, region.y + min_y, max_x - min_x, max_y - min_y);
            geometry.is_finite().then(|| TextBlock {
                text: block.text.clone(),
                geometry,
            })
        })
        .collect()
}
