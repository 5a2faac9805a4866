use thiserror::Error;

#[derive(Error, Debug)]
pub enum OcrError {
    #[error("Duplicate submission for image: {src}")]
    DuplicateSubmission { src: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Orchestrator is not running")]
    Stopped,
}

impl OcrError {
    /// Admission errors are the only ones reported back to a submitter
    pub fn is_admission_error(&self) -> bool {
        matches!(self, OcrError::DuplicateSubmission { .. })
    }
}

/// Errors raised while handing a message to the backend
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport channel closed")]
    Closed,

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("MQTT publish to {topic} failed: {source}")]
    Publish {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
}

pub type Result<T> = std::result::Result<T, OcrError>;
