//! Worker pool handle
//!
//! [`WorkerPool`] is the public face of the pool. It validates requests
//! synchronously, then forwards them to the coordinator thread. Results
//! come back through [`TaskTicket`]s, which can be awaited or waited on.

use crate::backend::coordinator::{Coordinator, PendingTask, PoolCommand};
use crate::backend::processor::{default_factory, ProcessorFactory};
use crate::backend::stats::{ProcessorStatistics, StatisticsTracker};
use crate::config::{PoolSettings, WorkerConfig, WorkerConfigPatch};
use crate::error::{ProcessorError, Result};
use crate::scripting::ScriptEngine;
use crate::types::{TaskId, TaskResult};
use crossbeam_channel::{unbounded, Sender};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::thread;
use tokio::sync::oneshot;

/// Pending result of one submitted buffer
///
/// Resolves to [`ProcessorError::PoolTerminated`] if the pool goes away
/// before the task finishes.
#[derive(Debug)]
pub struct TaskTicket {
    id: TaskId,
    receiver: oneshot::Receiver<TaskResult>,
}

impl TaskTicket {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block the current thread until the task resolves
    ///
    /// Must not be called from within an async runtime; `.await` the
    /// ticket there instead.
    pub fn wait(self) -> TaskResult {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(ProcessorError::PoolTerminated))
    }
}

impl Future for TaskTicket {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ProcessorError::PoolTerminated)))
    }
}

/// Pending results of a batch, one entry per submitted buffer
///
/// Resolves once every task has resolved; a failed task does not affect
/// its siblings.
#[derive(Debug)]
pub struct BatchTicket {
    tickets: Vec<TaskTicket>,
    results: Vec<Option<TaskResult>>,
}

impl BatchTicket {
    fn new(tickets: Vec<TaskTicket>) -> Self {
        let results = tickets.iter().map(|_| None).collect();
        Self { tickets, results }
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tickets.iter().map(TaskTicket::id).collect()
    }

    /// Block until every task resolves; see [`TaskTicket::wait`]
    pub fn wait(self) -> Vec<TaskResult> {
        self.tickets.into_iter().map(TaskTicket::wait).collect()
    }
}

impl Future for BatchTicket {
    type Output = Vec<TaskResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut pending = false;
        for (ticket, slot) in this.tickets.iter_mut().zip(this.results.iter_mut()) {
            if slot.is_some() {
                continue;
            }
            match Pin::new(ticket).poll(cx) {
                Poll::Ready(result) => *slot = Some(result),
                Poll::Pending => pending = true,
            }
        }

        if pending {
            return Poll::Pending;
        }
        Poll::Ready(
            this.results
                .iter_mut()
                .map(|slot| slot.take().unwrap_or(Err(ProcessorError::PoolTerminated)))
                .collect(),
        )
    }
}

/// A pool of frame-processing workers
pub struct WorkerPool {
    commands: Sender<PoolCommand>,
    config: Mutex<WorkerConfig>,
    script: Mutex<Option<String>>,
    validator: ScriptEngine,
    stats: Arc<StatisticsTracker>,
    next_task_id: AtomicU64,
    terminated: AtomicBool,
}

impl WorkerPool {
    /// Create a pool of [`crate::backend::FrameProcessor`] workers
    pub fn new(config: WorkerConfig, settings: PoolSettings) -> Result<Self> {
        Self::with_factory(config, settings, default_factory())
    }

    /// Create a pool whose workers are built by `factory`
    pub fn with_factory(
        config: WorkerConfig,
        settings: PoolSettings,
        factory: ProcessorFactory,
    ) -> Result<Self> {
        config.validate()?;
        settings.validate()?;

        let stats = Arc::new(StatisticsTracker::new(
            settings.crash_window(),
            settings.crash_threshold,
        ));
        let (commands, receiver) = unbounded();

        let validator = ScriptEngine::with_limits(settings.sandbox_limits());
        let mut coordinator =
            Coordinator::new(config.clone(), settings, factory, receiver, stats.clone());
        coordinator.populate();

        thread::Builder::new()
            .name("frameflow-coordinator".to_string())
            .spawn(move || coordinator.run())
            .map_err(|e| ProcessorError::Io(format!("failed to spawn coordinator: {}", e)))?;

        tracing::info!(
            "Worker pool started ({:?}, {} workers)",
            config.operation_mode,
            config.max_workers()
        );

        Ok(Self {
            commands,
            config: Mutex::new(config),
            script: Mutex::new(None),
            validator,
            stats,
            next_task_id: AtomicU64::new(1),
            terminated: AtomicBool::new(false),
        })
    }

    /// Submit a raw buffer for processing
    pub fn process_data(&self, buffer: impl Into<Vec<u8>>) -> TaskTicket {
        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::SeqCst));
        let (reply, receiver) = oneshot::channel();

        if self.terminated.load(Ordering::SeqCst) {
            let _ = reply.send(Err(ProcessorError::PoolTerminated));
        } else {
            let payload: Vec<u8> = buffer.into();
            let payload: Arc<[u8]> = Arc::from(payload);
            // A closed channel drops the reply, resolving the ticket as terminated
            let _ = self
                .commands
                .send(PoolCommand::Submit(PendingTask::new(id, payload, reply)));
        }

        TaskTicket { id, receiver }
    }

    /// Submit independent buffers; results come back in input order
    pub fn process_batch<I, B>(&self, buffers: I) -> BatchTicket
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let tickets: Vec<TaskTicket> = buffers
            .into_iter()
            .map(|buffer| self.process_data(buffer))
            .collect();
        BatchTicket::new(tickets)
    }

    /// Merge a partial configuration and apply it to the workers
    ///
    /// New workers start with it, idle workers switch before their next
    /// task and busy workers finish their current task first.
    pub fn update_config(&self, patch: WorkerConfigPatch) -> Result<()> {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        let next = config.merged(&patch);
        next.validate()?;

        self.send(PoolCommand::UpdateConfig(next.clone()))?;
        *config = next;
        Ok(())
    }

    /// Configuration applied to new and idle workers
    pub fn config(&self) -> WorkerConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Compile-check a parser script and install it on every worker
    ///
    /// An empty script clears the parser. A script that fails to compile is
    /// rejected and the current one stays in place.
    pub fn load_script(&self, source: &str) -> Result<()> {
        let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        let next = if source.trim().is_empty() {
            None
        } else {
            self.validator.validate(source)?;
            Some(source.to_string())
        };

        self.send(PoolCommand::LoadScript(next.clone()))?;
        *script = next;
        Ok(())
    }

    /// Parser script currently installed
    pub fn script(&self) -> Option<String> {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_parser_enabled(&self, enabled: bool) -> Result<()> {
        self.send(PoolCommand::SetParserEnabled(enabled))
    }

    /// Clear every worker's buffered bytes and frame numbering
    pub fn reset_workers(&self) -> Result<()> {
        self.send(PoolCommand::ResetWorkers)
    }

    fn send(&self, command: PoolCommand) -> Result<()> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ProcessorError::PoolTerminated);
        }
        self.commands
            .send(command)
            .map_err(|_| ProcessorError::PoolTerminated)
    }

    /// Stop the pool and wait for its workers to exit
    ///
    /// Queued tasks are rejected, running tasks finish within the shutdown
    /// grace period. Calling it again is a no-op.
    pub async fn terminate(&self) {
        if let Some(done) = self.request_termination() {
            let _ = done.await;
        }
    }

    /// Blocking form of [`Self::terminate`] for synchronous callers
    pub fn terminate_blocking(&self) {
        if let Some(done) = self.request_termination() {
            let _ = done.blocking_recv();
        }
    }

    fn request_termination(&self) -> Option<oneshot::Receiver<()>> {
        self.terminated.store(true, Ordering::SeqCst);
        let (done, receiver) = oneshot::channel();
        self.commands
            .send(PoolCommand::Terminate(done))
            .ok()
            .map(|_| receiver)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn statistics(&self) -> ProcessorStatistics {
        self.stats.snapshot()
    }

    pub fn active_worker_count(&self) -> usize {
        self.stats.active_workers()
    }

    pub fn queued_task_count(&self) -> usize {
        self.stats.queued_tasks()
    }

    pub fn is_healthy(&self) -> bool {
        self.stats.is_healthy()
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config())
            .field("terminated", &self.is_terminated())
            .field("statistics", &self.statistics())
            .finish_non_exhaustive()
    }
}
