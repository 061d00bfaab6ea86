//! Worker Thread Implementation
//!
//! Each worker is a named OS thread that owns one [`TaskProcessor`] and
//! handles its command channel strictly in order. Because configuration
//! and script updates travel through the same channel as tasks, a busy
//! worker finishes its current task under the old settings and picks up
//! the new ones before its next task.
//!
//! The worker reports back to the coordinator with [`WorkerEvent`]s. When
//! the thread ends, for any reason including a panic, a drop guard sends
//! [`WorkerEvent::Exited`] so the coordinator can recover the task it was
//! running.

use crate::backend::processor::TaskProcessor;
use crate::config::WorkerConfig;
use crate::error::{ProcessorError, Result};
use crate::types::{TaskId, TaskOutput, TaskResult, WorkerId};
use crossbeam_channel::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Commands sent from the coordinator to one worker
#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// Apply a new configuration before the next task
    Configure(WorkerConfig),
    /// Replace the parser script; `None` clears it
    LoadScript(Option<String>),
    /// Enable or disable the parser
    SetParserEnabled(bool),
    /// Clear the accumulation buffer and frame numbering
    Reset,
    /// Process one raw buffer
    Process { task_id: TaskId, payload: Arc<[u8]> },
    /// Exit after the commands already queued
    Stop,
}

/// Events sent from workers to the coordinator
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker picked up a task
    Started { worker_id: WorkerId, task_id: TaskId },
    /// The worker is about to handle the next frame of a task
    Progress { worker_id: WorkerId, task_id: TaskId },
    /// The worker finished a task
    Completed {
        worker_id: WorkerId,
        task_id: TaskId,
        result: TaskResult,
        elapsed: Duration,
    },
    /// The worker thread ended
    Exited { worker_id: WorkerId, panicked: bool },
}

/// A worker thread's state
pub struct Worker {
    id: WorkerId,
    processor: Box<dyn TaskProcessor>,
    commands: Receiver<WorkerCommand>,
    events: Sender<WorkerEvent>,
}

/// Reports the thread's exit, including unwinding after a panic
struct ExitGuard {
    id: WorkerId,
    events: Sender<WorkerEvent>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let panicked = thread::panicking();
        if panicked {
            tracing::error!("Worker {} panicked", self.id);
        }
        let _ = self.events.send(WorkerEvent::Exited {
            worker_id: self.id,
            panicked,
        });
    }
}

impl Worker {
    pub fn new(
        id: WorkerId,
        processor: Box<dyn TaskProcessor>,
        commands: Receiver<WorkerCommand>,
        events: Sender<WorkerEvent>,
    ) -> Self {
        Self {
            id,
            processor,
            commands,
            events,
        }
    }

    /// Start the worker on its own named thread
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("frameflow-worker-{}", self.id.0))
            .spawn(move || self.run())
            .map_err(|e| ProcessorError::Io(format!("failed to spawn worker thread: {}", e)))
    }

    /// Run the command loop until stopped or disconnected
    pub fn run(mut self) {
        let _guard = ExitGuard {
            id: self.id,
            events: self.events.clone(),
        };
        tracing::info!("Worker {} started", self.id);

        while let Ok(command) = self.commands.recv() {
            match command {
                WorkerCommand::Configure(config) => {
                    if let Err(e) = self.processor.configure(&config) {
                        tracing::warn!("Worker {} rejected configuration: {}", self.id, e);
                    }
                }
                WorkerCommand::LoadScript(source) => {
                    if let Err(e) = self.processor.load_script(source.as_deref()) {
                        tracing::warn!("Worker {} failed to load script: {}", self.id, e);
                    }
                }
                WorkerCommand::SetParserEnabled(enabled) => {
                    self.processor.set_parser_enabled(enabled);
                }
                WorkerCommand::Reset => self.processor.reset(),
                WorkerCommand::Process { task_id, payload } => {
                    if !self.process(task_id, &payload) {
                        break;
                    }
                }
                WorkerCommand::Stop => break,
            }
        }

        tracing::info!("Worker {} stopped", self.id);
    }

    /// Returns false once the coordinator is gone
    fn process(&mut self, task_id: TaskId, payload: &[u8]) -> bool {
        let _ = self.events.send(WorkerEvent::Started {
            worker_id: self.id,
            task_id,
        });
        tracing::trace!(
            "Worker {} processing {} ({} bytes)",
            self.id,
            task_id,
            payload.len()
        );

        let worker_id = self.id;
        let events = &self.events;
        let mut heartbeat = || {
            let _ = events.send(WorkerEvent::Progress { worker_id, task_id });
        };

        let started = Instant::now();
        let result = self.processor.process(payload, &mut heartbeat);
        let elapsed = started.elapsed();

        let result = result.map(|processed| TaskOutput {
            task_id,
            worker_id,
            frames: processed.frames,
            overflow: processed.overflow,
            processing_time: elapsed,
        });

        self.events
            .send(WorkerEvent::Completed {
                worker_id: self.id,
                task_id,
                result,
                elapsed,
            })
            .is_ok()
    }
}
