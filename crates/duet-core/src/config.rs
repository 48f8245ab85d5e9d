//! Engine configuration

use crate::{types::StreamKind, Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default byte budget buffered ahead of the playhead for video
pub const DEFAULT_VIDEO_BUFFER_TARGET: u64 = 50_000_000;

/// Default byte budget buffered ahead of the playhead for audio
pub const DEFAULT_AUDIO_BUFFER_TARGET: u64 = 5_000_000;

/// Fetch retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Sleep before the first retry; doubles per attempt
    #[serde(with = "millis")]
    pub initial_backoff: Duration,
    /// Timeout for the first attempt; doubles after every timeout
    #[serde(with = "millis")]
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Backoff slept after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1 << exp)
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Playback position (seconds) whose segment is fetched first
    pub start_time: f64,
    /// Initial byte budget ahead of the playhead for video
    pub video_buffer_target: u64,
    /// Initial byte budget ahead of the playhead for audio
    pub audio_buffer_target: u64,
    /// Append queue depth above which backpressure is logged
    pub append_queue_warn_depth: usize,
    /// Most segments removed per capacity failure
    pub max_evictions: usize,
    /// New target as a fraction of measured occupancy after a capacity failure
    pub target_shrink_factor: f64,
    /// Slack (seconds) allowed when matching a segment against buffered ranges
    pub buffered_tolerance: f64,
    /// Quiet period before a seek is acted upon
    pub seek_debounce_ms: u64,
    /// Evict-and-retry rounds allowed for one append before it is dropped
    pub max_append_retries: u32,
    /// Drop fetches that were issued before the most recent seek
    pub discard_stale_fetches: bool,
    /// Fetch retry policy
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            video_buffer_target: DEFAULT_VIDEO_BUFFER_TARGET,
            audio_buffer_target: DEFAULT_AUDIO_BUFFER_TARGET,
            append_queue_warn_depth: 2,
            max_evictions: 10,
            target_shrink_factor: 0.8,
            buffered_tolerance: 0.01,
            seek_debounce_ms: 500,
            max_append_retries: 3,
            discard_stale_fetches: false,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON document; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.video_buffer_target == 0 || self.audio_buffer_target == 0 {
            return Err(Error::InvalidConfig("buffer targets must be non-zero".into()));
        }
        if !(self.target_shrink_factor > 0.0 && self.target_shrink_factor <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "target_shrink_factor {} outside (0, 1]",
                self.target_shrink_factor
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidConfig("retry.max_attempts must be at least 1".into()));
        }
        if !self.start_time.is_finite() || self.start_time < 0.0 {
            return Err(Error::InvalidConfig(format!("bad start_time {}", self.start_time)));
        }
        Ok(())
    }

    pub fn buffer_target(&self, kind: StreamKind) -> u64 {
        match kind {
            StreamKind::Video => self.video_buffer_target,
            StreamKind::Audio => self.audio_buffer_target,
        }
    }

    pub fn seek_debounce(&self) -> Duration {
        Duration::from_millis(self.seek_debounce_ms)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
