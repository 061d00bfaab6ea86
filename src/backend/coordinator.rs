//! Pool coordinator
//!
//! The coordinator thread is the only owner of the task queue, the worker
//! records and the active-job table. Pool handles talk to it through
//! [`PoolCommand`]s, workers through [`WorkerEvent`]s, and it publishes
//! counters to the shared [`StatisticsTracker`].
//!
//! # Recovery
//!
//! A worker that exits while holding a task, or stays busy past the stall
//! timeout, is counted as crashed. Its task goes back to the front of the
//! queue until it has crashed `max_task_retries + 1` times, after which the
//! caller receives [`ProcessorError::WorkerCrash`]. A replacement worker is
//! spawned while the pool is running. Events from workers that are no
//! longer tracked are ignored.

use crate::backend::processor::ProcessorFactory;
use crate::backend::stats::StatisticsTracker;
use crate::backend::worker::{Worker, WorkerCommand, WorkerEvent};
use crate::config::{PoolSettings, WorkerConfig};
use crate::error::{ProcessorError, Result};
use crate::types::{TaskId, TaskResult, WorkerId};
use crossbeam_channel::{never, unbounded, Receiver, Sender};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// How often the coordinator wakes without traffic
const TICK: Duration = Duration::from_millis(20);

/// Wait between attempts to restore the pool after a failed worker spawn
const RESPAWN_BACKOFF: Duration = Duration::from_millis(100);

/// A submitted buffer waiting for, or held by, a worker
#[derive(Debug)]
pub struct PendingTask {
    pub id: TaskId,
    pub payload: Arc<[u8]>,
    pub submitted_at: Instant,
    /// Crashes this task has already been through
    pub attempts: u32,
    pub reply: oneshot::Sender<TaskResult>,
}

impl PendingTask {
    pub fn new(id: TaskId, payload: Arc<[u8]>, reply: oneshot::Sender<TaskResult>) -> Self {
        Self {
            id,
            payload,
            submitted_at: Instant::now(),
            attempts: 0,
            reply,
        }
    }

    fn resolve(self, result: TaskResult) {
        // The caller may have dropped its ticket
        let _ = self.reply.send(result);
    }
}

/// Requests from pool handles
#[derive(Debug)]
pub enum PoolCommand {
    Submit(PendingTask),
    UpdateConfig(WorkerConfig),
    LoadScript(Option<String>),
    SetParserEnabled(bool),
    ResetWorkers,
    Terminate(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Terminating,
    Dead,
}

#[derive(Debug)]
struct WorkerRecord {
    commands: Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
    state: WorkerState,
    current_task: Option<TaskId>,
    busy_since: Option<Instant>,
}

impl WorkerRecord {
    fn is_active(&self) -> bool {
        matches!(self.state, WorkerState::Idle | WorkerState::Busy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolState {
    Running,
    Terminating { deadline: Instant },
    Terminated,
}

pub struct Coordinator {
    config: WorkerConfig,
    settings: PoolSettings,
    script: Option<String>,
    parser_enabled: bool,
    factory: ProcessorFactory,

    workers: BTreeMap<WorkerId, WorkerRecord>,
    /// Idle workers in the order they became idle
    idle: VecDeque<WorkerId>,
    queue: VecDeque<PendingTask>,
    active: HashMap<TaskId, PendingTask>,
    next_worker_id: u64,
    /// Earliest retry after a failed spawn left the pool short
    respawn_at: Option<Instant>,

    state: PoolState,
    shutdown_waiters: Vec<oneshot::Sender<()>>,

    commands: Receiver<PoolCommand>,
    events: Receiver<WorkerEvent>,
    events_tx: Sender<WorkerEvent>,
    stats: Arc<StatisticsTracker>,
}

impl Coordinator {
    pub fn new(
        config: WorkerConfig,
        settings: PoolSettings,
        factory: ProcessorFactory,
        commands: Receiver<PoolCommand>,
        stats: Arc<StatisticsTracker>,
    ) -> Self {
        let (events_tx, events) = unbounded();
        Self {
            config,
            settings,
            script: None,
            parser_enabled: true,
            factory,
            workers: BTreeMap::new(),
            idle: VecDeque::new(),
            queue: VecDeque::new(),
            active: HashMap::new(),
            next_worker_id: 1,
            respawn_at: None,
            state: PoolState::Running,
            shutdown_waiters: Vec::new(),
            commands,
            events,
            events_tx,
            stats,
        }
    }

    /// Spawn workers up to the configured pool size
    pub fn populate(&mut self) {
        self.ensure_workers();
        self.publish();
    }

    /// Run until the pool has terminated
    pub fn run(mut self) {
        tracing::info!("Pool coordinator started with {} workers", self.active_count());

        loop {
            let commands = self.commands.clone();
            let events = self.events.clone();
            crossbeam_channel::select! {
                recv(commands) -> msg => match msg {
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        // Every pool handle is gone
                        self.commands = never();
                        self.begin_termination();
                    }
                },
                recv(events) -> msg => {
                    if let Ok(event) = msg {
                        self.handle_event(event);
                    }
                },
                default(TICK) => {}
            }

            self.check_stalls();
            self.retry_spawns();
            if self.poll_termination() {
                break;
            }
            self.publish();
        }

        tracing::info!("Pool coordinator stopped");
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit(task) => {
                if self.state != PoolState::Running {
                    self.stats.task_failed();
                    task.resolve(Err(ProcessorError::PoolTerminated));
                    return;
                }
                tracing::trace!("Queued {}", task.id);
                self.queue.push_back(task);
                self.ensure_workers();
                self.dispatch();
            }
            PoolCommand::UpdateConfig(config) => {
                tracing::debug!("Applying new worker configuration");
                self.config = config.clone();
                self.broadcast(WorkerCommand::Configure(config));
                self.ensure_workers();
                self.retire_surplus();
                self.dispatch();
            }
            PoolCommand::LoadScript(script) => {
                self.script = script.clone();
                self.broadcast(WorkerCommand::LoadScript(script));
            }
            PoolCommand::SetParserEnabled(enabled) => {
                self.parser_enabled = enabled;
                self.broadcast(WorkerCommand::SetParserEnabled(enabled));
            }
            PoolCommand::ResetWorkers => self.broadcast(WorkerCommand::Reset),
            PoolCommand::Terminate(done) => {
                self.shutdown_waiters.push(done);
                self.begin_termination();
            }
        }
    }

    /// Send a command to every worker still accepting work
    fn broadcast(&mut self, command: WorkerCommand) {
        for record in self.workers.values().filter(|r| r.is_active()) {
            let _ = record.commands.send(command.clone());
        }
    }

    // ========================================================================
    // Worker events
    // ========================================================================

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Started { worker_id, task_id }
            | WorkerEvent::Progress { worker_id, task_id } => {
                if let Some(record) = self.workers.get_mut(&worker_id) {
                    if record.current_task == Some(task_id) {
                        record.busy_since = Some(Instant::now());
                    }
                }
            }
            WorkerEvent::Completed {
                worker_id,
                task_id,
                result,
                elapsed,
            } => self.complete(worker_id, task_id, result, elapsed),
            WorkerEvent::Exited {
                worker_id,
                panicked,
            } => self.worker_exited(worker_id, panicked),
        }
    }

    fn complete(
        &mut self,
        worker_id: WorkerId,
        task_id: TaskId,
        result: TaskResult,
        elapsed: Duration,
    ) {
        let Some(record) = self.workers.get_mut(&worker_id) else {
            tracing::debug!("Ignoring result of {} from untracked {}", task_id, worker_id);
            return;
        };
        if record.current_task != Some(task_id) {
            tracing::debug!("Ignoring stale result of {} from {}", task_id, worker_id);
            return;
        }

        record.current_task = None;
        record.busy_since = None;
        if record.state == WorkerState::Busy {
            record.state = WorkerState::Idle;
            self.idle.push_back(worker_id);
        }

        if let Some(task) = self.active.remove(&task_id) {
            tracing::trace!(
                "{} finished on {} after {:?}",
                task_id,
                worker_id,
                task.submitted_at.elapsed()
            );
            self.stats.task_processed(elapsed);
            task.resolve(result);
        }

        self.retire_surplus();
        self.dispatch();
    }

    fn worker_exited(&mut self, worker_id: WorkerId, panicked: bool) {
        let Some(mut record) = self.workers.remove(&worker_id) else {
            return;
        };
        if let Some(handle) = record.handle.take() {
            let _ = handle.join();
        }
        self.stats.worker_terminated();

        let crashed = panicked
            || record.state != WorkerState::Terminating
            || record.current_task.is_some();
        if crashed {
            tracing::warn!("Worker {} exited unexpectedly", worker_id);
            self.stats.record_crash();
            if let Some(task_id) = record.current_task {
                self.recover_task(task_id);
            }
            self.ensure_workers();
            self.dispatch();
        } else {
            tracing::debug!("Worker {} exited", worker_id);
        }
    }

    /// Requeue a task whose worker died, or fail it once out of retries
    fn recover_task(&mut self, task_id: TaskId) {
        let Some(mut task) = self.active.remove(&task_id) else {
            return;
        };
        task.attempts += 1;

        if self.state != PoolState::Running {
            self.stats.task_failed();
            task.resolve(Err(ProcessorError::PoolTerminated));
        } else if task.attempts > self.settings.max_task_retries {
            tracing::error!("{} failed after {} worker crashes", task_id, task.attempts);
            self.stats.task_failed();
            let attempts = task.attempts;
            task.resolve(Err(ProcessorError::WorkerCrash {
                task_id: task_id.0,
                attempts,
            }));
        } else {
            tracing::warn!("Requeueing {} (attempt {})", task_id, task.attempts + 1);
            self.queue.push_front(task);
        }
    }

    /// Treat workers busy past the stall timeout as crashed
    fn check_stalls(&mut self) {
        let timeout = self.settings.stall_timeout();
        let stalled: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, r)| r.current_task.is_some())
            .filter(|(_, r)| r.busy_since.is_some_and(|since| since.elapsed() > timeout))
            .map(|(id, _)| *id)
            .collect();

        if stalled.is_empty() {
            return;
        }
        for worker_id in stalled {
            tracing::warn!(
                "Worker {} stalled for more than {:?}, abandoning it",
                worker_id,
                timeout
            );
            if let Some(task_id) = self.abandon(worker_id) {
                self.stats.record_crash();
                self.recover_task(task_id);
            }
        }
        self.ensure_workers();
        self.dispatch();
    }

    /// Stop tracking a worker without waiting for its thread
    ///
    /// Returns the task it was holding.
    fn abandon(&mut self, worker_id: WorkerId) -> Option<TaskId> {
        let record = self.workers.remove(&worker_id)?;
        self.stats.worker_terminated();
        // Dropping the handle detaches the thread; its later events are ignored
        record.current_task
    }

    // ========================================================================
    // Scheduling
    // ========================================================================

    fn active_count(&self) -> usize {
        self.workers.values().filter(|r| r.is_active()).count()
    }

    fn ensure_workers(&mut self) {
        if self.state != PoolState::Running {
            return;
        }
        while self.active_count() < self.config.max_workers() {
            if let Err(e) = self.spawn_worker() {
                if self.respawn_at.is_none() {
                    tracing::error!("Failed to start worker: {}", e);
                } else {
                    tracing::debug!("Worker spawn retry failed: {}", e);
                }
                self.respawn_at = Some(Instant::now() + RESPAWN_BACKOFF);
                return;
            }
        }
        if self.respawn_at.take().is_some() {
            tracing::info!("Pool restored to {} workers", self.active_count());
        }
    }

    /// Try again to fill the pool after a failed spawn
    fn retry_spawns(&mut self) {
        if self.respawn_at.is_some_and(|at| Instant::now() >= at) {
            self.ensure_workers();
            self.dispatch();
        }
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let processor = (self.factory)(&self.config, &self.settings)?;
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;

        let (commands, receiver) = unbounded();
        if let Some(script) = &self.script {
            let _ = commands.send(WorkerCommand::LoadScript(Some(script.clone())));
        }
        if !self.parser_enabled {
            let _ = commands.send(WorkerCommand::SetParserEnabled(false));
        }

        let handle = Worker::new(id, processor, receiver, self.events_tx.clone()).spawn()?;
        self.workers.insert(
            id,
            WorkerRecord {
                commands,
                handle: Some(handle),
                state: WorkerState::Idle,
                current_task: None,
                busy_since: None,
            },
        );
        self.idle.push_back(id);
        self.stats.worker_created();
        Ok(())
    }

    /// Stop idle workers beyond the configured pool size
    fn retire_surplus(&mut self) {
        while self.active_count() > self.config.max_workers() {
            let Some(worker_id) = self.next_idle() else {
                // Busy workers are retired once they finish
                break;
            };
            if let Some(record) = self.workers.get_mut(&worker_id) {
                tracing::debug!("Retiring {}", worker_id);
                let _ = record.commands.send(WorkerCommand::Stop);
                record.state = WorkerState::Terminating;
            }
        }
    }

    fn next_idle(&mut self) -> Option<WorkerId> {
        while let Some(id) = self.idle.pop_front() {
            if self
                .workers
                .get(&id)
                .is_some_and(|r| r.state == WorkerState::Idle)
            {
                return Some(id);
            }
        }
        None
    }

    /// Hand queued tasks to idle workers, oldest task first
    fn dispatch(&mut self) {
        while self.state == PoolState::Running && !self.queue.is_empty() {
            let Some(worker_id) = self.next_idle() else {
                break;
            };
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            let Some(record) = self.workers.get_mut(&worker_id) else {
                self.queue.push_front(task);
                continue;
            };

            let command = WorkerCommand::Process {
                task_id: task.id,
                payload: task.payload.clone(),
            };
            if record.commands.send(command).is_err() {
                // Thread already gone; its exit event is on the way
                record.state = WorkerState::Dead;
                self.queue.push_front(task);
                continue;
            }

            tracing::trace!("Dispatched {} to {}", task.id, worker_id);
            record.state = WorkerState::Busy;
            record.current_task = Some(task.id);
            record.busy_since = Some(Instant::now());
            self.active.insert(task.id, task);
        }
        self.publish();
    }

    fn publish(&self) {
        self.stats.set_occupancy(self.active_count(), self.queue.len());
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    fn begin_termination(&mut self) {
        if self.state != PoolState::Running {
            return;
        }
        tracing::info!(
            "Terminating pool: {} queued tasks rejected, {} in flight",
            self.queue.len(),
            self.active.len()
        );
        self.state = PoolState::Terminating {
            deadline: Instant::now() + self.settings.shutdown_grace(),
        };

        for task in self.queue.drain(..) {
            self.stats.task_failed();
            task.resolve(Err(ProcessorError::PoolTerminated));
        }
        for record in self.workers.values_mut() {
            let _ = record.commands.send(WorkerCommand::Stop);
            if record.state != WorkerState::Dead {
                record.state = WorkerState::Terminating;
            }
        }
        self.idle.clear();
        self.publish();
    }

    /// Returns true once the pool has fully terminated
    fn poll_termination(&mut self) -> bool {
        match self.state {
            PoolState::Running => return false,
            PoolState::Terminated => return true,
            PoolState::Terminating { deadline } => {
                if !self.workers.is_empty() && Instant::now() < deadline {
                    return false;
                }
            }
        }

        let remaining: Vec<WorkerId> = self.workers.keys().copied().collect();
        if !remaining.is_empty() {
            tracing::warn!("Abandoning {} workers after the grace period", remaining.len());
        }
        for worker_id in remaining {
            if let Some(task_id) = self.abandon(worker_id) {
                if let Some(task) = self.active.remove(&task_id) {
                    self.stats.task_failed();
                    task.resolve(Err(ProcessorError::PoolTerminated));
                }
            }
        }

        self.state = PoolState::Terminated;
        self.publish();
        for done in self.shutdown_waiters.drain(..) {
            let _ = done.send(());
        }
        true
    }
}
