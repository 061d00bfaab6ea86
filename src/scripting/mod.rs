//! Rhai Scripting Sandbox for Frame Parsers
//!
//! This module runs user-supplied parsing scripts against single frames.
//! Scripts cannot touch the host: module imports are disabled, `eval` is
//! removed, `print`/`debug` go to tracing, and every call is bounded by an
//! operation budget and a wall-clock deadline.
//!
//! ## Script Forms
//!
//! A parser either defines a `parse` function taking the frame as a string:
//! ```rhai
//! fn parse(frame) {
//!     frame.split(",")
//! }
//! ```
//!
//! or is a plain expression with `frame` (string) and `bytes` (blob) in scope:
//! ```rhai
//! [bytes[0], bytes[1] * 256 + bytes[2]]
//! ```
//!
//! The two-argument `parse(frame, separator)` form is rejected.
//!
//! ## Return Values
//!
//! - An array becomes one dataset per element
//! - A map becomes one dataset per value, in key order
//! - `()` produces no datasets
//! - Any other value becomes a single dataset
//!
//! ## Helper Functions
//!
//! - `to_number(text)` - Parse text as a float, returning the text unchanged on failure
//! - `parse_json(text)` - Parse a JSON document into maps/arrays/values

mod engine;
pub mod parser;

pub use engine::ScriptEngine;
pub use parser::{FrameParser, ParserMetrics, ParserState};

use crate::config::{DEFAULT_MAX_OPERATIONS, DEFAULT_PARSE_TIMEOUT_MS};
use rhai::AST;
use std::time::Duration;

/// Name of the entry point a parser script may define
pub const PARSE_FN: &str = "parse";

/// Resource budget applied to each parse call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Wall-clock budget
    pub timeout: Duration,
    /// Interpreter operation budget
    pub max_operations: u64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_PARSE_TIMEOUT_MS),
            max_operations: DEFAULT_MAX_OPERATIONS,
        }
    }
}

/// How a compiled script is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    /// Call `parse(frame)`
    Function,
    /// Evaluate the script body with `frame`/`bytes` in scope
    Expression,
}

/// A compiled parser script
#[derive(Clone)]
pub struct CompiledParser {
    /// The compiled AST
    ast: AST,
    /// The original source code
    source: String,
    entry: EntryPoint,
}

impl CompiledParser {
    /// Get the source code of this parser
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn entry(&self) -> EntryPoint {
        self.entry
    }
}

impl std::fmt::Debug for CompiledParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledParser")
            .field("entry", &self.entry)
            .field("source", &self.source)
            .finish()
    }
}

/// Outcome of a static syntax check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxCheck {
    pub valid: bool,
    pub error: Option<String>,
}

impl SyntaxCheck {
    pub fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// Built-in parser scripts for common frame layouts
pub mod builtins {
    /// Comma separated values, numbers converted where possible
    pub const CSV: &str = r#"
fn parse(frame) {
    let values = [];
    for field in frame.split(",") {
        field.trim();
        if field.len() > 0 {
            values.push(to_number(field));
        }
    }
    values
}
"#;

    /// JSON object or array; object values in key order
    pub const JSON: &str = r#"
fn parse(frame) {
    let data = parse_json(frame);
    if type_of(data) == "map" {
        data.values()
    } else {
        data
    }
}
"#;

    /// Tab separated values
    pub const TSV: &str = r#"
fn parse(frame) {
    let values = [];
    for field in frame.split("\t") {
        field.trim();
        if field.len() > 0 {
            values.push(to_number(field));
        }
    }
    values
}
"#;

    /// Every byte of the frame as a number
    pub const RAW_BYTES: &str = r#"
// Expression form: `bytes` holds the raw frame
let values = [];
for i in 0..bytes.len() {
    values.push(bytes[i]);
}
values
"#;

    /// List of all built-in parsers with names
    pub fn all() -> Vec<(&'static str, &'static str)> {
        vec![
            ("CSV", CSV),
            ("JSON", JSON),
            ("TSV", TSV),
            ("Raw Bytes", RAW_BYTES),
        ]
    }
}
