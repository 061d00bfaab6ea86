//! Core data types for frameflow-rs
//!
//! These are the values that move between the pool, its workers and the
//! callers of [`crate::backend::WorkerPool`].
//!
//! # Main Types
//!
//! - [`Frame`] - One delimited unit of bytes produced by the frame detector
//! - [`DatasetValue`] - A single typed value extracted from a frame
//! - [`ParseResult`] - Outcome of running the parser against one frame
//! - [`FrameOutcome`] / [`TaskOutput`] - Per-frame and per-task results

use crate::error::{DetectionError, ParseError, ProcessorError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Unique, monotonically increasing task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Identifier of a worker execution unit; never reused within a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A delimited unit of raw bytes from the device
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Position of this frame in the worker's stream
    pub sequence: u64,
    /// Frame bytes; still includes any trailing checksum bytes
    pub payload: Vec<u8>,
    /// When the frame was extracted
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    pub fn new(sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Payload decoded lossily as UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A single value extracted from a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetValue {
    Number(f64),
    Bool(bool),
    Text(String),
}

impl DatasetValue {
    /// Interpret a text field, preferring a number when it parses as one
    pub fn from_field(field: &str) -> Self {
        match field.parse::<f64>() {
            Ok(n) if n.is_finite() => DatasetValue::Number(n),
            _ => DatasetValue::Text(field.to_string()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DatasetValue::Number(n) => Some(*n),
            DatasetValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            DatasetValue::Text(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for DatasetValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatasetValue::Number(n) => write!(f, "{}", n),
            DatasetValue::Bool(b) => write!(f, "{}", b),
            DatasetValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for DatasetValue {
    fn from(value: f64) -> Self {
        DatasetValue::Number(value)
    }
}

impl From<&str> for DatasetValue {
    fn from(value: &str) -> Self {
        DatasetValue::Text(value.to_string())
    }
}

impl From<bool> for DatasetValue {
    fn from(value: bool) -> Self {
        DatasetValue::Bool(value)
    }
}

/// Outcome of parsing a single frame
///
/// `data` is meaningful when `success` is true, `error` otherwise.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParseResult {
    pub success: bool,
    pub data: Option<Vec<DatasetValue>>,
    pub error: Option<ParseError>,
    pub execution_time: Option<Duration>,
}

impl ParseResult {
    pub fn ok(data: Vec<DatasetValue>, execution_time: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time: Some(execution_time),
        }
    }

    pub fn failed(error: ParseError, execution_time: Duration) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            execution_time: Some(execution_time),
        }
    }

    /// Successful result with no values and no sandbox invocation
    pub fn empty() -> Self {
        Self {
            success: true,
            data: Some(Vec::new()),
            error: None,
            execution_time: None,
        }
    }

    /// Values produced, empty on failure
    pub fn values(&self) -> &[DatasetValue] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn into_result(self) -> Result<Vec<DatasetValue>, ParseError> {
        match (self.success, self.data, self.error) {
            (true, data, _) => Ok(data.unwrap_or_default()),
            (false, _, Some(err)) => Err(err),
            (false, _, None) => Err(ParseError::Script("parse failed".to_string())),
        }
    }
}

/// Result for one frame inside a task
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// Datasets, or the checksum/parse error that dropped this frame
    pub result: Result<Vec<DatasetValue>, ProcessorError>,
}

impl FrameOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// What a processor made of one buffer
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessedBuffer {
    /// Frames in extraction order
    pub frames: Vec<FrameOutcome>,
    /// Unconsumed bytes dropped because the buffer was over capacity
    pub overflow: Option<DetectionError>,
}

/// Everything a worker produced for one submitted buffer
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    /// Frames in extraction order
    pub frames: Vec<FrameOutcome>,
    /// Set when this buffer pushed the worker's accumulation buffer over capacity
    pub overflow: Option<DetectionError>,
    /// Worker-side processing time
    pub processing_time: Duration,
}

impl TaskOutput {
    /// Datasets of every frame that parsed successfully
    pub fn datasets(&self) -> impl Iterator<Item = &Vec<DatasetValue>> {
        self.frames.iter().filter_map(|f| f.result.as_ref().ok())
    }

    /// Frames dropped by checksum or parse errors
    pub fn error_count(&self) -> usize {
        self.frames.iter().filter(|f| f.result.is_err()).count()
    }
}

/// Result delivered to a caller of `process_data`
pub type TaskResult = Result<TaskOutput, ProcessorError>;
