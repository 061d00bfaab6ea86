//! Frame parser state machine
//!
//! [`FrameParser`] owns a [`ScriptEngine`] and at most one loaded script.
//! It is `NoScript` until a script loads, `Loaded` afterwards, and
//! `Disabled` while switched off. A failed load keeps the previous
//! script; an empty script clears it.

use crate::scripting::{builtins, CompiledParser, SandboxLimits, ScriptEngine, SyntaxCheck};
use crate::types::ParseResult;
use std::time::{Duration, Instant};

/// Current parser state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    NoScript,
    Loaded,
    Disabled,
}

/// Running execution metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParserMetrics {
    pub total_executions: u64,
    pub total_time: Duration,
    pub last_execution_time: Duration,
}

impl ParserMetrics {
    /// Average time per execution, zero before the first one
    pub fn average_time(&self) -> Duration {
        if self.total_executions == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total_time.as_nanos() / u128::from(self.total_executions);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.total_executions += 1;
        self.total_time += elapsed;
        self.last_execution_time = elapsed;
    }
}

/// Script-driven parser for single frames
#[derive(Debug)]
pub struct FrameParser {
    engine: ScriptEngine,
    script: Option<CompiledParser>,
    enabled: bool,
    last_error: Option<String>,
    metrics: ParserMetrics,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::with_limits(SandboxLimits::default())
    }

    pub fn with_limits(limits: SandboxLimits) -> Self {
        Self {
            engine: ScriptEngine::with_limits(limits),
            script: None,
            enabled: true,
            last_error: None,
            metrics: ParserMetrics::default(),
        }
    }

    /// Template offered to users starting a new parser
    pub fn default_script() -> &'static str {
        builtins::CSV
    }

    pub fn state(&self) -> ParserState {
        match (self.enabled, &self.script) {
            (false, _) => ParserState::Disabled,
            (true, Some(_)) => ParserState::Loaded,
            (true, None) => ParserState::NoScript,
        }
    }

    /// Compile and install a script
    ///
    /// Returns false on failure; the error is kept in [`Self::last_error`]
    /// and any previously loaded script stays active.
    pub fn load_script(&mut self, source: &str) -> bool {
        if source.trim().is_empty() {
            self.script = None;
            self.last_error = None;
            return true;
        }

        match self.engine.compile(source) {
            Ok(compiled) => {
                self.script = Some(compiled);
                self.last_error = None;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to load parser script: {}", e);
                self.last_error = Some(e.to_string());
                false
            }
        }
    }

    /// Parse one frame
    ///
    /// Returns an empty successful result when disabled or without a script.
    pub fn parse(&mut self, frame: &[u8]) -> ParseResult {
        if !self.enabled {
            return ParseResult::empty();
        }
        let Some(script) = &self.script else {
            return ParseResult::empty();
        };

        let started = Instant::now();
        let outcome = self.engine.execute(script, frame);
        let elapsed = started.elapsed();
        self.metrics.record(elapsed);

        match outcome {
            Ok(values) => ParseResult::ok(values, elapsed),
            Err(e) => {
                tracing::debug!("Parser script failed: {}", e);
                ParseResult::failed(e, elapsed)
            }
        }
    }

    /// Parse each frame independently; output order matches input order
    pub fn parse_multiple<I, F>(&mut self, frames: I) -> Vec<ParseResult>
    where
        I: IntoIterator<Item = F>,
        F: AsRef<[u8]>,
    {
        frames
            .into_iter()
            .map(|frame| self.parse(frame.as_ref()))
            .collect()
    }

    /// Check a script without touching the loaded one
    pub fn validate_syntax(&self, source: &str) -> SyntaxCheck {
        self.engine.check_syntax(source)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Source of the loaded script
    pub fn script(&self) -> Option<&str> {
        self.script.as_ref().map(|s| s.source())
    }

    pub fn has_script(&self) -> bool {
        self.script.is_some()
    }

    /// Error from the most recent failed load
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Unload the script and forget the last error
    pub fn clear(&mut self) {
        self.script = None;
        self.last_error = None;
    }

    pub fn metrics(&self) -> ParserMetrics {
        self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = ParserMetrics::default();
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}
