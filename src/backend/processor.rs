//! Per-worker frame processing
//!
//! A [`TaskProcessor`] is everything a worker thread owns: the frame
//! detector with its accumulation buffer, checksum validation and the
//! sandboxed parser. [`FrameProcessor`] is the production implementation;
//! tests plug in their own through [`ProcessorFactory`].

use crate::config::{OperationMode, PoolSettings, WorkerConfig};
use crate::error::{ParseError, ProcessorError, Result};
use crate::framing::{checksum, FrameReader};
use crate::scripting::FrameParser;
use crate::types::{DatasetValue, Frame, FrameOutcome, ProcessedBuffer};
use std::sync::Arc;

/// Work performed by a single worker
///
/// Implementations are moved onto the worker thread and never shared.
pub trait TaskProcessor: Send + 'static {
    /// Switch to a new configuration; buffered bytes are discarded
    fn configure(&mut self, config: &WorkerConfig) -> Result<()>;

    /// Replace the parser script; `None` clears it
    fn load_script(&mut self, source: Option<&str>) -> Result<()>;

    fn set_parser_enabled(&mut self, enabled: bool);

    /// Drop buffered bytes and restart frame numbering
    fn reset(&mut self);

    /// Push a raw buffer through detection, validation and parsing
    ///
    /// `heartbeat` is called before each frame so the pool can tell a long
    /// task from a stuck one. Per-frame failures are reported inside the
    /// outcomes. An `Err` means the whole buffer was rejected.
    fn process(
        &mut self,
        payload: &[u8],
        heartbeat: &mut dyn FnMut(),
    ) -> Result<ProcessedBuffer>;
}

/// Builds the processor for each new worker
pub type ProcessorFactory =
    Arc<dyn Fn(&WorkerConfig, &PoolSettings) -> Result<Box<dyn TaskProcessor>> + Send + Sync>;

/// Factory producing [`FrameProcessor`]s
pub fn default_factory() -> ProcessorFactory {
    Arc::new(|config, settings| {
        let processor = FrameProcessor::new(config, settings)?;
        Ok(Box::new(processor) as Box<dyn TaskProcessor>)
    })
}

/// Detector, checksum validator and parser for one worker
#[derive(Debug)]
pub struct FrameProcessor {
    mode: OperationMode,
    reader: FrameReader,
    parser: FrameParser,
}

impl FrameProcessor {
    pub fn new(config: &WorkerConfig, settings: &PoolSettings) -> Result<Self> {
        Ok(Self {
            mode: config.operation_mode,
            reader: FrameReader::new(config)?,
            parser: FrameParser::with_limits(settings.sandbox_limits()),
        })
    }

    pub fn reader(&self) -> &FrameReader {
        &self.reader
    }

    pub fn parser(&self) -> &FrameParser {
        &self.parser
    }

    fn process_frame(
        &mut self,
        frame: &Frame,
    ) -> std::result::Result<Vec<DatasetValue>, ProcessorError> {
        let payload = checksum::validate(&frame.payload, self.reader.checksum()).map_err(|e| {
            tracing::debug!("Dropping frame {}: {}", frame.sequence, e);
            ProcessorError::from(e)
        })?;

        match self.mode {
            OperationMode::QuickPlot => Ok(csv_fields(payload)),
            OperationMode::DeviceSendsJson => json_values(payload).map_err(ProcessorError::from),
            OperationMode::ProjectFile => self
                .parser
                .parse(payload)
                .into_result()
                .map_err(ProcessorError::from),
        }
    }
}

impl TaskProcessor for FrameProcessor {
    fn configure(&mut self, config: &WorkerConfig) -> Result<()> {
        self.reader = FrameReader::new(config)?;
        self.mode = config.operation_mode;
        Ok(())
    }

    fn load_script(&mut self, source: Option<&str>) -> Result<()> {
        match source {
            Some(source) if !self.parser.load_script(source) => Err(ProcessorError::ScriptLoad(
                self.parser.last_error().unwrap_or("invalid script").to_string(),
            )),
            Some(_) => Ok(()),
            None => {
                self.parser.clear();
                Ok(())
            }
        }
    }

    fn set_parser_enabled(&mut self, enabled: bool) {
        self.parser.set_enabled(enabled);
    }

    fn reset(&mut self) {
        self.reader.reset();
    }

    fn process(
        &mut self,
        payload: &[u8],
        heartbeat: &mut dyn FnMut(),
    ) -> Result<ProcessedBuffer> {
        let pushed = self.reader.push(payload);

        let frames = pushed
            .frames
            .iter()
            .map(|frame| {
                heartbeat();
                FrameOutcome {
                    sequence: frame.sequence,
                    timestamp: frame.timestamp,
                    result: self.process_frame(frame),
                }
            })
            .collect();

        Ok(ProcessedBuffer {
            frames,
            overflow: pushed.overflow,
        })
    }
}

/// Comma separated fields; blanks dropped, numbers parsed
fn csv_fields(payload: &[u8]) -> Vec<DatasetValue> {
    String::from_utf8_lossy(payload)
        .split(',')
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .map(DatasetValue::from_field)
        .collect()
}

/// Values of a JSON object in document order, or the elements of an array
fn json_values(payload: &[u8]) -> std::result::Result<Vec<DatasetValue>, ParseError> {
    let document: serde_json::Value = serde_json::from_slice(payload)
        .map_err(|e| ParseError::InvalidOutput(format!("invalid JSON frame: {}", e)))?;

    Ok(match document {
        serde_json::Value::Object(fields) => fields.into_values().filter_map(json_value).collect(),
        serde_json::Value::Array(items) => items.into_iter().filter_map(json_value).collect(),
        scalar => json_value(scalar).into_iter().collect(),
    })
}

fn json_value(value: serde_json::Value) -> Option<DatasetValue> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(DatasetValue::Bool(b)),
        serde_json::Value::Number(n) => n.as_f64().map(DatasetValue::Number),
        serde_json::Value::String(s) => Some(DatasetValue::Text(s)),
        nested => Some(DatasetValue::Text(nested.to_string())),
    }
}
