//! Worker and pool settings
//!
//! [`WorkerConfig`] describes how a byte stream is framed, validated and
//! mapped to datasets. [`PoolSettings`] holds the scheduling and sandbox
//! limits of a [`crate::backend::WorkerPool`].
//!
//! # Main Types
//!
//! - [`OperationMode`] - How frame payloads map to datasets
//! - [`FrameDetection`] - Delimiter strategy for segmenting the stream
//! - [`WorkerConfig`] - Complete per-worker configuration
//! - [`WorkerConfigPatch`] - Partial update merged by `update_config`
//! - [`PoolSettings`] - Pool sizing, retry budget, timeouts

use crate::error::{ProcessorError, Result};
use crate::framing::checksum::ChecksumAlgorithm;
use crate::scripting::SandboxLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default cap on a worker's accumulation buffer (10 MiB)
pub const DEFAULT_BUFFER_CAPACITY: usize = 10 * 1024 * 1024;

/// Default pool size when `max_workers` is unset
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default wall-clock budget for one parse call in milliseconds
pub const DEFAULT_PARSE_TIMEOUT_MS: u64 = 5_000;

/// Default operation budget for one parse call
pub const DEFAULT_MAX_OPERATIONS: u64 = 500_000;

/// Default number of redispatches after a worker crash
pub const DEFAULT_MAX_TASK_RETRIES: u32 = 2;

/// Default time a busy worker may stay silent before it is considered crashed
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 15_000;

/// Default time `terminate` waits for workers to exit
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Default window for crash-rate health checks in seconds
pub const DEFAULT_CRASH_WINDOW_SECS: u64 = 60;

/// Crashes within the window above which the pool reports unhealthy
pub const DEFAULT_CRASH_THRESHOLD: usize = 5;

/// How frame payloads are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OperationMode {
    /// Framing and parsing come from the project's script and delimiters
    #[default]
    ProjectFile,
    /// Each frame is a JSON document between start/finish delimiters
    #[serde(rename = "DeviceSendsJSON", alias = "DeviceSendsJson")]
    DeviceSendsJson,
    /// Line-delimited comma separated values
    QuickPlot,
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationMode::ProjectFile => write!(f, "ProjectFile"),
            OperationMode::DeviceSendsJson => write!(f, "DeviceSendsJSON"),
            OperationMode::QuickPlot => write!(f, "QuickPlot"),
        }
    }
}

/// Delimiter strategy for segmenting a byte stream into frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FrameDetection {
    #[default]
    EndDelimiterOnly,
    StartAndEndDelimiter,
    NoDelimiters,
    StartDelimiterOnly,
}

impl FrameDetection {
    pub const ALL: [FrameDetection; 4] = [
        FrameDetection::EndDelimiterOnly,
        FrameDetection::StartAndEndDelimiter,
        FrameDetection::NoDelimiters,
        FrameDetection::StartDelimiterOnly,
    ];

    pub fn needs_start(self) -> bool {
        matches!(
            self,
            FrameDetection::StartAndEndDelimiter | FrameDetection::StartDelimiterOnly
        )
    }

    pub fn needs_finish(self) -> bool {
        matches!(
            self,
            FrameDetection::EndDelimiterOnly | FrameDetection::StartAndEndDelimiter
        )
    }
}

/// Per-worker frame processing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub operation_mode: OperationMode,

    #[serde(default)]
    pub frame_detection: FrameDetection,

    #[serde(default, with = "byte_sequence")]
    pub start_sequence: Vec<u8>,

    #[serde(default = "default_finish_sequence", with = "byte_sequence")]
    pub finish_sequence: Vec<u8>,

    /// Checksum identifier; `"none"` or empty disables validation
    #[serde(default = "default_checksum")]
    pub checksum_algorithm: String,

    /// Cap on the accumulation buffer, [`DEFAULT_BUFFER_CAPACITY`] when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer_capacity: Option<usize>,

    /// Upper bound on pool size, [`DEFAULT_MAX_WORKERS`] when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
}

fn default_finish_sequence() -> Vec<u8> {
    b"\n".to_vec()
}

fn default_checksum() -> String {
    "none".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            operation_mode: OperationMode::default(),
            frame_detection: FrameDetection::default(),
            start_sequence: Vec::new(),
            finish_sequence: default_finish_sequence(),
            checksum_algorithm: default_checksum(),
            buffer_capacity: None,
            max_workers: None,
        }
    }
}

impl WorkerConfig {
    /// Line-delimited CSV input
    pub fn quick_plot() -> Self {
        Self {
            operation_mode: OperationMode::QuickPlot,
            ..Default::default()
        }
    }

    /// JSON documents between `start` and `finish`
    pub fn device_json(start: impl Into<Vec<u8>>, finish: impl Into<Vec<u8>>) -> Self {
        Self {
            operation_mode: OperationMode::DeviceSendsJson,
            frame_detection: FrameDetection::StartAndEndDelimiter,
            start_sequence: start.into(),
            finish_sequence: finish.into(),
            ..Default::default()
        }
    }

    /// Detection mode actually used for the configured operation mode
    pub fn effective_detection(&self) -> FrameDetection {
        match self.operation_mode {
            OperationMode::ProjectFile => self.frame_detection,
            OperationMode::DeviceSendsJson => FrameDetection::StartAndEndDelimiter,
            // Line endings; handled specially by the frame reader
            OperationMode::QuickPlot => FrameDetection::EndDelimiterOnly,
        }
    }

    /// Checksum actually applied; only project mode validates checksums
    pub fn effective_checksum(&self) -> Result<ChecksumAlgorithm> {
        let algorithm: ChecksumAlgorithm = self.checksum_algorithm.parse()?;
        Ok(match self.operation_mode {
            OperationMode::ProjectFile => algorithm,
            _ => ChecksumAlgorithm::None,
        })
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity.unwrap_or(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS)
    }

    /// Reject invalid delimiter/algorithm/mode combinations
    pub fn validate(&self) -> Result<()> {
        // Unknown identifiers fail even in modes that ignore the checksum
        self.checksum_algorithm.parse::<ChecksumAlgorithm>()?;

        if self.operation_mode != OperationMode::QuickPlot {
            let detection = self.effective_detection();
            if detection.needs_start() && self.start_sequence.is_empty() {
                return Err(ProcessorError::Configuration(format!(
                    "{:?} requires a non-empty start sequence",
                    detection
                )));
            }
            if detection.needs_finish() && self.finish_sequence.is_empty() {
                return Err(ProcessorError::Configuration(format!(
                    "{:?} requires a non-empty finish sequence",
                    detection
                )));
            }
        }

        if self.buffer_capacity == Some(0) {
            return Err(ProcessorError::Configuration(
                "buffer capacity must be greater than zero".to_string(),
            ));
        }
        if self.max_workers == Some(0) {
            return Err(ProcessorError::Configuration(
                "max_workers must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Merge a partial update, returning the new configuration
    pub fn merged(&self, patch: &WorkerConfigPatch) -> WorkerConfig {
        let mut next = self.clone();
        if let Some(mode) = patch.operation_mode {
            next.operation_mode = mode;
        }
        if let Some(detection) = patch.frame_detection {
            next.frame_detection = detection;
        }
        if let Some(start) = &patch.start_sequence {
            next.start_sequence = start.clone();
        }
        if let Some(finish) = &patch.finish_sequence {
            next.finish_sequence = finish.clone();
        }
        if let Some(algorithm) = &patch.checksum_algorithm {
            next.checksum_algorithm = algorithm.clone();
        }
        if let Some(capacity) = patch.buffer_capacity {
            next.buffer_capacity = Some(capacity);
        }
        if let Some(max) = patch.max_workers {
            next.max_workers = Some(max);
        }
        next
    }
}

/// Partial [`WorkerConfig`]; `None` fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfigPatch {
    pub operation_mode: Option<OperationMode>,
    pub frame_detection: Option<FrameDetection>,
    pub start_sequence: Option<Vec<u8>>,
    pub finish_sequence: Option<Vec<u8>>,
    pub checksum_algorithm: Option<String>,
    pub buffer_capacity: Option<usize>,
    pub max_workers: Option<usize>,
}

impl WorkerConfigPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_mode(mut self, mode: OperationMode) -> Self {
        self.operation_mode = Some(mode);
        self
    }

    pub fn frame_detection(mut self, detection: FrameDetection) -> Self {
        self.frame_detection = Some(detection);
        self
    }

    pub fn start_sequence(mut self, start: impl Into<Vec<u8>>) -> Self {
        self.start_sequence = Some(start.into());
        self
    }

    pub fn finish_sequence(mut self, finish: impl Into<Vec<u8>>) -> Self {
        self.finish_sequence = Some(finish.into());
        self
    }

    pub fn checksum_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.checksum_algorithm = Some(algorithm.into());
        self
    }

    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = Some(capacity);
        self
    }

    pub fn max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max);
        self
    }
}

/// Scheduling, retry and sandbox limits for a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Wall-clock budget per parse call
    pub parse_timeout_ms: u64,
    /// Interpreter operation budget per parse call, `0` for unlimited
    pub max_operations: u64,
    /// Redispatches allowed after worker crashes before a task fails
    pub max_task_retries: u32,
    /// Silence after which a busy worker is treated as crashed
    pub stall_timeout_ms: u64,
    /// How long `terminate` waits for workers before abandoning them
    pub shutdown_grace_ms: u64,
    /// Window for the crash-rate health check
    pub crash_window_secs: u64,
    /// Crashes tolerated within the window
    pub crash_threshold: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            parse_timeout_ms: DEFAULT_PARSE_TIMEOUT_MS,
            max_operations: DEFAULT_MAX_OPERATIONS,
            max_task_retries: DEFAULT_MAX_TASK_RETRIES,
            stall_timeout_ms: DEFAULT_STALL_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            crash_window_secs: DEFAULT_CRASH_WINDOW_SECS,
            crash_threshold: DEFAULT_CRASH_THRESHOLD,
        }
    }
}

impl PoolSettings {
    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            timeout: Duration::from_millis(self.parse_timeout_ms),
            max_operations: self.max_operations,
        }
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn crash_window(&self) -> Duration {
        Duration::from_secs(self.crash_window_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parse_timeout_ms == 0 {
            return Err(ProcessorError::Configuration(
                "parse_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.stall_timeout_ms <= self.parse_timeout_ms {
            return Err(ProcessorError::Configuration(format!(
                "stall_timeout_ms ({}) must exceed parse_timeout_ms ({})",
                self.stall_timeout_ms, self.parse_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Serialize byte sequences as strings when they are UTF-8, else as arrays
pub mod byte_sequence {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match std::str::from_utf8(bytes) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(bytes.iter()),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into_bytes(),
            Repr::Bytes(bytes) => bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_capacity(), DEFAULT_BUFFER_CAPACITY);
        assert_eq!(config.max_workers(), DEFAULT_MAX_WORKERS);
    }

    #[test]
    fn test_empty_finish_rejected() {
        let config = WorkerConfig {
            finish_sequence: Vec::new(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_start_and_end_requires_both() {
        let config = WorkerConfig {
            frame_detection: FrameDetection::StartAndEndDelimiter,
            start_sequence: Vec::new(),
            finish_sequence: b">".to_vec(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WorkerConfig {
            start_sequence: b"<".to_vec(),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_no_delimiters_allows_empty_sequences() {
        let config = WorkerConfig {
            frame_detection: FrameDetection::NoDelimiters,
            start_sequence: Vec::new(),
            finish_sequence: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_checksum_rejected() {
        let config = WorkerConfig {
            checksum_algorithm: "crc-99".to_string(),
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn test_quick_plot_ignores_delimiters_and_checksum() {
        let config = WorkerConfig {
            finish_sequence: Vec::new(),
            checksum_algorithm: "crc8".to_string(),
            ..WorkerConfig::quick_plot()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_checksum().unwrap(), ChecksumAlgorithm::None);
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = WorkerConfig {
            buffer_capacity: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = WorkerConfig {
            max_workers: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_patch_merge_keeps_unset_fields() {
        let base = WorkerConfig {
            checksum_algorithm: "xor".to_string(),
            ..Default::default()
        };
        let patch = WorkerConfigPatch::new()
            .frame_detection(FrameDetection::StartDelimiterOnly)
            .start_sequence("$");
        let merged = base.merged(&patch);

        assert_eq!(merged.frame_detection, FrameDetection::StartDelimiterOnly);
        assert_eq!(merged.start_sequence, b"$".to_vec());
        assert_eq!(merged.checksum_algorithm, "xor");
        assert_eq!(merged.finish_sequence, b"\n".to_vec());
    }

    #[test]
    fn test_operation_mode_serde_names() {
        let json = serde_json::to_string(&OperationMode::DeviceSendsJson).unwrap();
        assert_eq!(json, "\"DeviceSendsJSON\"");
        let mode: OperationMode = serde_json::from_str("\"DeviceSendsJson\"").unwrap();
        assert_eq!(mode, OperationMode::DeviceSendsJson);
    }

    #[test]
    fn test_byte_sequence_serialization() {
        let config = WorkerConfig {
            start_sequence: vec![0xAA, 0x55],
            finish_sequence: b"\r\n".to_vec(),
            ..Default::default()
        };
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["start_sequence"], serde_json::json!([170, 85]));
        assert_eq!(json["finish_sequence"], serde_json::json!("\r\n"));

        let back: WorkerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_pool_settings_defaults() {
        let settings = PoolSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(
            settings.sandbox_limits().timeout,
            Duration::from_millis(DEFAULT_PARSE_TIMEOUT_MS)
        );
        assert_eq!(settings.max_task_retries, DEFAULT_MAX_TASK_RETRIES);
    }

    #[test]
    fn test_stall_timeout_must_exceed_parse_timeout() {
        let settings = PoolSettings {
            parse_timeout_ms: 500,
            stall_timeout_ms: 500,
            ..PoolSettings::default()
        };
        assert!(settings.validate().unwrap_err().is_configuration());

        let settings = PoolSettings {
            stall_timeout_ms: 501,
            ..settings
        };
        assert!(settings.validate().is_ok());
    }
}
