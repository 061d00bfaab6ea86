//! Mock processors for driving the pool through crash, stall and
//! back-pressure scenarios

use crossbeam_channel::{unbounded, Receiver, Sender};
use frameflow_rs::backend::{ProcessorFactory, TaskProcessor};
use frameflow_rs::config::WorkerConfig;
use frameflow_rs::error::{ProcessorError, Result};
use frameflow_rs::types::{DatasetValue, FrameOutcome, ProcessedBuffer};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Payload that makes a [`ScriptedProcessor`] panic
pub const CRASH: &[u8] = b"crash";

/// Payload that makes a [`ScriptedProcessor`] sleep past any stall timeout
pub const HANG: &[u8] = b"hang";

/// Echoes the payload length as a single frame, with hooks to misbehave
pub struct ScriptedProcessor {
    gate: Option<Receiver<()>>,
    crashes_left: Arc<AtomicUsize>,
    hang_for: Duration,
}

impl TaskProcessor for ScriptedProcessor {
    fn configure(&mut self, _config: &WorkerConfig) -> Result<()> {
        Ok(())
    }

    fn load_script(&mut self, _source: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn set_parser_enabled(&mut self, _enabled: bool) {}

    fn reset(&mut self) {}

    fn process(&mut self, payload: &[u8], _heartbeat: &mut dyn FnMut()) -> Result<ProcessedBuffer> {
        if let Some(gate) = &self.gate {
            gate.recv()
                .map_err(|_| ProcessorError::Io("gate closed".to_string()))?;
        }
        if payload == CRASH {
            panic!("simulated worker crash");
        }
        let flaky_crash = payload.starts_with(b"flaky")
            && self
                .crashes_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if flaky_crash {
            panic!("simulated flaky crash");
        }
        if payload == HANG {
            std::thread::sleep(self.hang_for);
        }

        Ok(ProcessedBuffer {
            frames: vec![FrameOutcome {
                sequence: 0,
                timestamp: chrono::Utc::now(),
                result: Ok(vec![DatasetValue::Number(payload.len() as f64)]),
            }],
            overflow: None,
        })
    }
}

/// Factory options for [`ScriptedProcessor`]s
#[derive(Clone, Default)]
pub struct MockFactory {
    gate: Option<Receiver<()>>,
    /// Panics left for payloads starting with `flaky`
    crashes_left: Arc<AtomicUsize>,
    hang_for: Duration,
    /// Successful builds allowed before the factory starts failing
    build_limit: Option<usize>,
    /// Refuse every build while set; shared between clones
    refusing: Arc<AtomicBool>,
    builds: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task waits for one message on the returned sender
    pub fn gated(mut self) -> (Self, Sender<()>) {
        let (tx, rx) = unbounded();
        self.gate = Some(rx);
        (self, tx)
    }

    /// The next `count` `flaky*` payloads crash their worker
    pub fn flaky(mut self, count: usize) -> Self {
        self.crashes_left = Arc::new(AtomicUsize::new(count));
        self
    }

    pub fn hang_for(mut self, duration: Duration) -> Self {
        self.hang_for = duration;
        self
    }

    /// Fail to build any worker after the first `limit`
    pub fn build_limit(mut self, limit: usize) -> Self {
        self.build_limit = Some(limit);
        self
    }

    /// Make builds fail until called again with `false`
    pub fn refuse_builds(&self, refuse: bool) {
        self.refusing.store(refuse, Ordering::SeqCst);
    }

    /// Build attempts so far, including refused ones
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    pub fn into_factory(self) -> ProcessorFactory {
        Arc::new(move |_config, _settings| {
            let built = self.builds.fetch_add(1, Ordering::SeqCst);
            if self.refusing.load(Ordering::SeqCst)
                || self.build_limit.is_some_and(|limit| built >= limit)
            {
                return Err(ProcessorError::Io("worker build refused".to_string()));
            }
            Ok(Box::new(ScriptedProcessor {
                gate: self.gate.clone(),
                crashes_left: self.crashes_left.clone(),
                hang_for: self.hang_for,
            }) as Box<dyn TaskProcessor>)
        })
    }
}
