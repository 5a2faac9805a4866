//! Wire messages exchanged with the OCR backend.
//!
//! Messages are JSON objects tagged by `type`. Outbound messages ask the
//! backend to segment an image or recognize one region; inbound events
//! report detected regions and recognition results.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Stable identifier of one submitted image
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        JobId(value.to_string())
    }
}

/// Axis-aligned rectangle in scaled image coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Geometry {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }
}

/// A candidate text region as reported by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedRegion {
    pub id: u64,
    #[serde(flatten)]
    pub geometry: Geometry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundMessage {
    /// Ask the backend to segment an image into text regions
    ChunkRequest {
        job_id: JobId,
        src: String,
        width: u32,
        height: u32,
        chunks: Vec<u32>,
        scale: f64,
    },
    /// Ask the backend to run OCR on one region
    RecognizeRequest {
        job_id: JobId,
        region_id: u64,
        engine: String,
        geometry: Geometry,
        scale: f64,
    },
}

impl OutboundMessage {
    pub fn job_id(&self) -> &JobId {
        match self {
            OutboundMessage::ChunkRequest { job_id, .. } => job_id,
            OutboundMessage::RecognizeRequest { job_id, .. } => job_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::ChunkRequest { .. } => "chunk-request",
            OutboundMessage::RecognizeRequest { .. } => "recognize-request",
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundEvent {
    RegionsDetected {
        job_id: JobId,
        #[serde(default)]
        regions: Vec<DetectedRegion>,
    },
    Recognized {
        job_id: JobId,
        region_id: u64,
        engine: String,
        result: RecognitionPayload,
    },
}

impl InboundEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            InboundEvent::RegionsDetected { job_id, .. } => job_id,
            InboundEvent::Recognized { job_id, .. } => job_id,
        }
    }

    pub fn decode(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

/// Raw recognition output for one region.
///
/// Either `error` is set (the backend gave up on the region) or the text is
/// carried by `blocks`, falling back to `text` when no blocks are present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecognitionPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub blocks: Vec<RawBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecognitionPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// One recognized text block in region-local, engine-transformed space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBlock {
    pub text: String,
    #[serde(deserialize_with = "lenient_coord")]
    pub x0: f64,
    #[serde(deserialize_with = "lenient_coord")]
    pub y0: f64,
    #[serde(deserialize_with = "lenient_coord")]
    pub x1: f64,
    #[serde(deserialize_with = "lenient_coord")]
    pub y1: f64,
    #[serde(default)]
    pub transform: BlockTransform,
}

/// Rotation (degrees, about the region centre) and scale the engine applied
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockTransform {
    #[serde(default, deserialize_with = "lenient_coord")]
    pub rotation_deg: f64,
    #[serde(default = "unit_scale", deserialize_with = "lenient_coord")]
    pub scale: f64,
}

impl Default for BlockTransform {
    fn default() -> Self {
        Self {
            rotation_deg: 0.0,
            scale: 1.0,
        }
    }
}

fn unit_scale() -> f64 {
    1.0
}

/// Coordinates that are not numbers decode as NaN instead of failing the
/// whole event, so they surface as a malformed region downstream.
fn lenient_coord<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(f64::NAN),
        _ => f64::NAN,
    })
}
