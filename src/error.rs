//! Error handling for frameflow-rs
//!
//! Pool-boundary failures are [`ProcessorError`]. Per-frame problems are
//! carried as data inside results ([`ChecksumError`], [`DetectionError`],
//! [`ParseError`]) so one bad frame never aborts a batch.

use std::time::Duration;
use thiserror::Error;

/// Main error type for frame processing operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessorError {
    /// Invalid delimiter/algorithm/mode combination
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Frame detection failed for a task
    #[error("Detection error: {0}")]
    Detection(#[from] DetectionError),

    /// Frame integrity check failed
    #[error("Checksum error: {0}")]
    Checksum(#[from] ChecksumError),

    /// Script failed to compile or validate
    #[error("Script load error: {0}")]
    ScriptLoad(String),

    /// Script execution failed or ran out of budget
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// Worker died and the retry budget for the task is exhausted
    #[error("Worker crashed while processing task {task_id} ({attempts} attempts)")]
    WorkerCrash { task_id: u64, attempts: u32 },

    /// Task submitted to (or queued in) a terminated pool
    #[error("Pool terminated")]
    PoolTerminated,

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<ProcessorError>,
    },
}

impl ProcessorError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        ProcessorError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script load error from a Rhai parse error
    pub fn from_rhai_parse_error(err: rhai::ParseError) -> Self {
        ProcessorError::ScriptLoad(err.to_string())
    }

    /// Strip any context wrappers
    pub fn root(&self) -> &ProcessorError {
        match self {
            ProcessorError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error must fail fast at the API boundary
    pub fn is_configuration(&self) -> bool {
        matches!(self.root(), ProcessorError::Configuration(_))
    }
}

impl From<std::io::Error> for ProcessorError {
    fn from(err: std::io::Error) -> Self {
        ProcessorError::Io(err.to_string())
    }
}

/// Frame integrity mismatch
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{algorithm} mismatch: expected {expected:02X?}, computed {computed:02X?}")]
pub struct ChecksumError {
    pub algorithm: String,
    /// Trailing bytes carried by the frame
    pub expected: Vec<u8>,
    /// Bytes computed over the payload
    pub computed: Vec<u8>,
}

/// Problems in the frame detector's buffer state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectionError {
    /// Accumulated bytes exceeded the configured capacity
    #[error("buffer capacity of {capacity} bytes exceeded, dropped {dropped} oldest bytes")]
    BufferOverflow { capacity: usize, dropped: usize },

    /// A delimiter required by the detection mode is empty
    #[error("{0} delimiter must not be empty")]
    EmptyDelimiter(&'static str),
}

/// Sandbox execution failures, reported per frame
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("script error: {0}")]
    Script(String),

    #[error("script exceeded its {}ms budget", .0.as_millis())]
    Timeout(Duration),

    #[error("unsupported script output: {0}")]
    InvalidOutput(String),
}

/// Result type alias for frameflow-rs operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
