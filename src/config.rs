use crate::error::{OcrError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub metrics_bind: String,
    pub mqtt_config: MqttConfig,
    pub ocr_config: OcrConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub request_topic: String, // orchestrator -> backend
    pub event_topic: String,   // backend -> orchestrator
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: format!("feed-ocr-{}", uuid::Uuid::new_v4().simple()),
            request_topic: "ocr/requests".to_string(),
            event_topic: "ocr/events".to_string(),
            keep_alive_secs: 60,
        }
    }
}

/// Tunables for the orchestrator core.
///
/// The quiet period and detection grace are heuristics: the backend never
/// says "all regions done", so a job is complete once it has been silent
/// for long enough. Slow backends need larger values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrConfig {
    /// Silence after the last accepted region event before a job finalizes
    pub quiet_period_ms: u64,
    /// How long to wait for the first region-detection event
    pub detection_grace_ms: u64,
    /// Minimum gap between two outbound sends
    pub send_interval_ms: u64,
    /// Height of one vertical scan strip, in scaled pixels
    pub chunk_size: u32,
    /// Overlap between consecutive strips; must be smaller than chunk_size
    pub chunk_overlap: u32,
    /// Applied to the submitted image dimensions before planning
    pub render_scale: f64,
    pub default_engine: String,
    /// Number of finalized job ids remembered for late-event logging
    pub finalized_history: usize,
    /// Sources of finished jobs still rejected as duplicates. Queued and
    /// processing sources are always rejected.
    pub submission_history: usize,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            quiet_period_ms: 2000,
            detection_grace_ms: 5000,
            send_interval_ms: 500,
            chunk_size: 250,
            chunk_overlap: 90,
            render_scale: 1.0,
            default_engine: "ocrad".to_string(),
            finalized_history: 256,
            submission_history: 10_000,
        }
    }
}

impl OcrConfig {
    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn detection_grace(&self) -> Duration {
        Duration::from_millis(self.detection_grace_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(OcrError::Config("chunk_size must be positive".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(OcrError::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !self.render_scale.is_finite() || self.render_scale <= 0.0 {
            return Err(OcrError::Config(format!(
                "render_scale must be a positive number, got {}",
                self.render_scale
            )));
        }
        if self.default_engine.trim().is_empty() {
            return Err(OcrError::Config("default_engine must not be empty".to_string()));
        }
        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        let metrics_bind = env::var("METRICS_BIND").unwrap_or_else(|_| "0.0.0.0:9090".to_string());

        let mqtt_defaults = MqttConfig::default();
        let mqtt_config = MqttConfig {
            broker_host: env::var("MQTT_BROKER_HOST").unwrap_or(mqtt_defaults.broker_host),
            broker_port: env_or("MQTT_BROKER_PORT", mqtt_defaults.broker_port),
            client_id: env::var("MQTT_CLIENT_ID").unwrap_or(mqtt_defaults.client_id),
            request_topic: env::var("OCR_REQUEST_TOPIC").unwrap_or(mqtt_defaults.request_topic),
            event_topic: env::var("OCR_EVENT_TOPIC").unwrap_or(mqtt_defaults.event_topic),
            keep_alive_secs: env_or("MQTT_KEEP_ALIVE_SECS", mqtt_defaults.keep_alive_secs),
        };

        let ocr_defaults = OcrConfig::default();
        let ocr_config = OcrConfig {
            quiet_period_ms: env_or("OCR_QUIET_PERIOD_MS", ocr_defaults.quiet_period_ms),
            detection_grace_ms: env_or("OCR_DETECTION_GRACE_MS", ocr_defaults.detection_grace_ms),
            send_interval_ms: env_or("OCR_SEND_INTERVAL_MS", ocr_defaults.send_interval_ms),
            chunk_size: env_or("OCR_CHUNK_SIZE", ocr_defaults.chunk_size),
            chunk_overlap: env_or("OCR_CHUNK_OVERLAP", ocr_defaults.chunk_overlap),
            render_scale: env_or("OCR_RENDER_SCALE", ocr_defaults.render_scale),
            default_engine: env::var("OCR_DEFAULT_ENGINE").unwrap_or(ocr_defaults.default_engine),
            finalized_history: env_or("OCR_FINALIZED_HISTORY", ocr_defaults.finalized_history),
            submission_history: env_or("OCR_SUBMISSION_HISTORY", ocr_defaults.submission_history),
        };
        ocr_config.validate()?;

        Ok(Self {
            metrics_bind,
            mqtt_config,
            ocr_config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OcrConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.quiet_period(), Duration::from_millis(2000));
        assert_eq!(config.send_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let config = OcrConfig {
            chunk_size: 100,
            chunk_overlap: 100,
            ..OcrConfig::default()
        };
        assert!(matches!(config.validate(), Err(OcrError::Config(_))));
    }

    #[test]
    fn test_render_scale_must_be_positive() {
        let config = OcrConfig {
            render_scale: 0.0,
            ..OcrConfig::default()
        };
        assert!(config.validate().is_err());

        let config = OcrConfig {
            render_scale: f64::NAN,
            ..OcrConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
