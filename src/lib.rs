pub mod chunk;
pub mod completion;
pub mod config;
pub mod error;
pub mod handler;
pub mod job;
pub mod metrics;
pub mod mqtt_bridge;
pub mod orchestrator;
pub mod outbound;
pub mod protocol;
pub mod queue;
pub mod region;
pub mod transport;

// Re-export commonly used types for easier testing
pub use crate::chunk::{chunk_count, plan_chunks};
pub use crate::config::{Config, MqttConfig, OcrConfig};
pub use crate::error::{OcrError, Result, TransportError};
pub use crate::handler::{ChannelCompletionHandler, CompletionHandler, JobOutcome};
pub use crate::job::{ImageSource, JobStage, JobStatus};
pub use crate::orchestrator::{OcrHandle, Orchestrator, OrchestratorStats};
pub use crate::protocol::{DetectedRegion, Geometry, InboundEvent, JobId, OutboundMessage, RawBlock, RecognitionPayload};
pub use crate::region::{EnginePhase, GlyphLookup, LookupHit, NoLookupCache};
pub use crate::transport::{ChannelTransport, Transport};
