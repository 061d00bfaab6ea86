//! Sandboxed Rhai engine used by frame parsers
//!
//! One engine belongs to one [`super::FrameParser`], which belongs to one
//! worker, so nothing here is shared across threads at runtime.

use crate::error::{ParseError, ProcessorError, Result};
use crate::scripting::{CompiledParser, EntryPoint, SandboxLimits, SyntaxCheck, PARSE_FN};
use crate::types::DatasetValue;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Array, Blob, Dynamic, Engine, EvalAltResult, Map, Scope, FLOAT};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Token returned from the progress callback when the deadline passes
const DEADLINE_TOKEN: &str = "deadline exceeded";

/// How often (in operations) the progress callback reads the clock
const DEADLINE_CHECK_INTERVAL: u64 = 128;

/// Wall-clock deadline shared with the engine's progress callback
#[derive(Debug)]
struct Deadline {
    epoch: Instant,
    /// Microseconds since `epoch`; zero when no call is running
    at_us: AtomicU64,
}

impl Deadline {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            at_us: AtomicU64::new(0),
        }
    }

    fn arm(&self, limits: &SandboxLimits) {
        let at = self.epoch.elapsed() + limits.timeout;
        self.at_us
            .store((at.as_micros() as u64).max(1), Ordering::Relaxed);
    }

    fn disarm(&self) {
        self.at_us.store(0, Ordering::Relaxed);
    }

    fn expired(&self) -> bool {
        let at = self.at_us.load(Ordering::Relaxed);
        at != 0 && self.epoch.elapsed().as_micros() as u64 >= at
    }
}

/// The sandboxed script engine for frame parsers
pub struct ScriptEngine {
    /// The Rhai engine instance
    engine: Engine,
    deadline: Arc<Deadline>,
    limits: SandboxLimits,
}

impl ScriptEngine {
    /// Create a new script engine with default limits
    pub fn new() -> Self {
        Self::with_limits(SandboxLimits::default())
    }

    /// Create a new script engine with explicit limits
    pub fn with_limits(limits: SandboxLimits) -> Self {
        let deadline = Arc::new(Deadline::new());
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, deadline.clone(), &limits);

        Self {
            engine,
            deadline,
            limits,
        }
    }

    /// Configure the Rhai engine with sandbox restrictions and helpers
    fn configure_engine(engine: &mut Engine, deadline: Arc<Deadline>, limits: &SandboxLimits) {
        // Set safety limits
        engine.set_max_expr_depths(64, 64);
        engine.set_max_call_levels(32);
        engine.set_max_operations(limits.max_operations);
        engine.set_max_string_size(1_000_000);
        engine.set_max_array_size(100_000);
        engine.set_max_map_size(10_000);

        // No filesystem imports, no dynamic evaluation
        engine.set_module_resolver(DummyModuleResolver::new());
        engine.disable_symbol("eval");

        engine.on_print(|text| {
            tracing::debug!(target: "frameflow_rs::script", "{}", text);
        });
        engine.on_debug(|text, source, pos| {
            tracing::debug!(
                target: "frameflow_rs::script",
                "[{}:{}] {}",
                source.unwrap_or("parser"),
                pos,
                text
            );
        });

        engine.on_progress(move |count| {
            if count % DEADLINE_CHECK_INTERVAL == 0 && deadline.expired() {
                Some(DEADLINE_TOKEN.into())
            } else {
                None
            }
        });

        // ===== Helper Functions =====

        engine.register_fn("to_number", |text: &str| -> Dynamic {
            match text.trim().parse::<FLOAT>() {
                Ok(value) => Dynamic::from_float(value),
                Err(_) => Dynamic::from(text.to_string()),
            }
        });

        engine.register_fn(
            "parse_json",
            |text: &str| -> std::result::Result<Dynamic, Box<EvalAltResult>> {
                serde_json::from_str::<serde_json::Value>(text)
                    .map(json_to_dynamic)
                    .map_err(|e| format!("invalid JSON: {}", e).into())
            },
        );
    }

    /// Compile a parser script
    pub fn compile(&self, source: &str) -> Result<CompiledParser> {
        let ast = self
            .engine
            .compile(source)
            .map_err(ProcessorError::from_rhai_parse_error)?;

        let arities: Vec<usize> = ast
            .iter_functions()
            .filter(|f| f.name == PARSE_FN)
            .map(|f| f.params.len())
            .collect();

        let entry = if arities.contains(&1) {
            EntryPoint::Function
        } else if arities.contains(&2) {
            return Err(ProcessorError::ScriptLoad(
                "parse(frame, separator) is no longer supported, define parse(frame)".to_string(),
            ));
        } else {
            EntryPoint::Expression
        };

        Ok(CompiledParser {
            ast,
            source: source.to_string(),
            entry,
        })
    }

    /// Validate a script without executing it
    pub fn validate(&self, source: &str) -> Result<()> {
        self.compile(source).map(|_| ())
    }

    /// Static syntax check suitable for reporting to users
    pub fn check_syntax(&self, source: &str) -> SyntaxCheck {
        match self.compile(source) {
            Ok(_) => SyntaxCheck::ok(),
            Err(e) => SyntaxCheck::invalid(e.to_string()),
        }
    }

    /// Run a compiled parser against one frame
    pub fn execute(
        &self,
        parser: &CompiledParser,
        frame: &[u8],
    ) -> std::result::Result<Vec<DatasetValue>, ParseError> {
        let text = String::from_utf8_lossy(frame).into_owned();
        let mut scope = Scope::new();

        self.deadline.arm(&self.limits);
        let result = match parser.entry {
            EntryPoint::Function => {
                self.engine
                    .call_fn::<Dynamic>(&mut scope, &parser.ast, PARSE_FN, (text,))
            }
            EntryPoint::Expression => {
                let bytes: Blob = frame.to_vec();
                scope.push("frame", text);
                scope.push("bytes", bytes);
                self.engine
                    .eval_ast_with_scope::<Dynamic>(&mut scope, &parser.ast)
            }
        };
        self.deadline.disarm();

        match result {
            Ok(value) => Ok(to_datasets(value)),
            Err(err) => Err(self.map_error(*err)),
        }
    }

    fn map_error(&self, err: EvalAltResult) -> ParseError {
        match err {
            EvalAltResult::ErrorTerminated(..) => ParseError::Timeout(self.limits.timeout),
            EvalAltResult::ErrorInFunctionCall(_, _, inner, _)
                if matches!(*inner, EvalAltResult::ErrorTerminated(..)) =>
            {
                ParseError::Timeout(self.limits.timeout)
            }
            other => ParseError::Script(other.to_string()),
        }
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Flatten a script's return value into datasets
fn to_datasets(value: Dynamic) -> Vec<DatasetValue> {
    if value.is_unit() {
        return Vec::new();
    }
    if value.is_array() {
        let items: Array = value.into_array().unwrap_or_default();
        return items.into_iter().filter_map(to_dataset).collect();
    }
    if value.is_blob() {
        let bytes: Blob = value.into_blob().unwrap_or_default();
        return bytes
            .into_iter()
            .map(|b| DatasetValue::Number(b as f64))
            .collect();
    }
    if value.is_map() {
        return match value.try_cast::<Map>() {
            Some(map) => map.into_values().filter_map(to_dataset).collect(),
            None => Vec::new(),
        };
    }
    to_dataset(value).into_iter().collect()
}

fn to_dataset(value: Dynamic) -> Option<DatasetValue> {
    if value.is_unit() {
        None
    } else if let Ok(f) = value.as_float() {
        Some(DatasetValue::Number(f))
    } else if let Ok(i) = value.as_int() {
        Some(DatasetValue::Number(i as f64))
    } else if let Ok(b) = value.as_bool() {
        Some(DatasetValue::Bool(b))
    } else if value.is_string() {
        Some(DatasetValue::Text(value.into_string().unwrap_or_default()))
    } else if let Ok(c) = value.as_char() {
        Some(DatasetValue::Text(c.to_string()))
    } else {
        Some(DatasetValue::Text(value.to_string()))
    }
}

fn json_to_dynamic(value: serde_json::Value) -> Dynamic {
    match value {
        serde_json::Value::Null => Dynamic::UNIT,
        serde_json::Value::Bool(b) => Dynamic::from_bool(b),
        serde_json::Value::Number(n) => Dynamic::from_float(n.as_f64().unwrap_or(FLOAT::NAN)),
        serde_json::Value::String(s) => Dynamic::from(s),
        serde_json::Value::Array(items) => {
            let array: Array = items.into_iter().map(json_to_dynamic).collect();
            Dynamic::from_array(array)
        }
        serde_json::Value::Object(fields) => {
            let mut map = Map::new();
            for (key, value) in fields {
                map.insert(key.into(), json_to_dynamic(value));
            }
            Dynamic::from_map(map)
        }
    }
}
