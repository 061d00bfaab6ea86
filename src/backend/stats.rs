//! Pool statistics and health
//!
//! The coordinator is the only writer; any thread may take a snapshot.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Point-in-time view of a pool's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStatistics {
    /// Workers spawned over the pool's lifetime, replacements included
    pub workers_created: u64,
    /// Workers that exited, crashed or were abandoned
    pub workers_terminated: u64,
    /// Tasks a worker finished, whatever the task result
    pub tasks_processed: u64,
    /// Tasks failed by the pool (crash budget exhausted, shutdown)
    pub tasks_failed: u64,
    /// Worker-side time spent on processed tasks
    pub total_processing_time: Duration,
    /// `total_processing_time / tasks_processed`, zero when nothing ran
    pub average_processing_time: Duration,
    /// Workers able to accept tasks
    pub active_workers: usize,
    /// Tasks waiting for a worker
    pub queued_tasks: usize,
    /// Worker crashes inside the health window
    pub recent_crashes: usize,
}

/// Process-wide counters shared between the coordinator and pool handles
#[derive(Debug)]
pub struct StatisticsTracker {
    workers_created: AtomicU64,
    workers_terminated: AtomicU64,
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
    total_processing_us: AtomicU64,
    active_workers: AtomicUsize,
    queued_tasks: AtomicUsize,
    crashes: Mutex<VecDeque<Instant>>,
    crash_window: Duration,
    crash_threshold: usize,
}

impl StatisticsTracker {
    pub fn new(crash_window: Duration, crash_threshold: usize) -> Self {
        Self {
            workers_created: AtomicU64::new(0),
            workers_terminated: AtomicU64::new(0),
            tasks_processed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_processing_us: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            queued_tasks: AtomicUsize::new(0),
            crashes: Mutex::new(VecDeque::new()),
            crash_window,
            crash_threshold,
        }
    }

    pub fn worker_created(&self) {
        self.workers_created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn worker_terminated(&self) {
        self.workers_terminated.fetch_add(1, Ordering::SeqCst);
    }

    pub fn task_processed(&self, processing_time: Duration) {
        self.total_processing_us
            .fetch_add(processing_time.as_micros() as u64, Ordering::SeqCst);
        self.tasks_processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn task_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_crash(&self) {
        let mut crashes = self.crashes.lock().unwrap_or_else(PoisonError::into_inner);
        crashes.push_back(Instant::now());
        Self::prune(&mut crashes, self.crash_window);
    }

    /// Publish the coordinator's current worker and queue counts
    pub fn set_occupancy(&self, active_workers: usize, queued_tasks: usize) {
        self.active_workers.store(active_workers, Ordering::SeqCst);
        self.queued_tasks.store(queued_tasks, Ordering::SeqCst);
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn queued_tasks(&self) -> usize {
        self.queued_tasks.load(Ordering::SeqCst)
    }

    pub fn recent_crashes(&self) -> usize {
        let mut crashes = self.crashes.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune(&mut crashes, self.crash_window);
        crashes.len()
    }

    fn prune(crashes: &mut VecDeque<Instant>, window: Duration) {
        while let Some(oldest) = crashes.front() {
            if oldest.elapsed() > window {
                crashes.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> ProcessorStatistics {
        let tasks_processed = self.tasks_processed.load(Ordering::SeqCst);
        let total_processing_time =
            Duration::from_micros(self.total_processing_us.load(Ordering::SeqCst));
        let average_processing_time = if tasks_processed == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(total_processing_time.as_micros() as u64 / tasks_processed)
        };

        ProcessorStatistics {
            workers_created: self.workers_created.load(Ordering::SeqCst),
            workers_terminated: self.workers_terminated.load(Ordering::SeqCst),
            tasks_processed,
            tasks_failed: self.tasks_failed.load(Ordering::SeqCst),
            total_processing_time,
            average_processing_time,
            active_workers: self.active_workers(),
            queued_tasks: self.queued_tasks(),
            recent_crashes: self.recent_crashes(),
        }
    }

    /// Unhealthy when tasks wait with no worker to run them, or when
    /// workers crash faster than the configured threshold
    pub fn is_healthy(&self) -> bool {
        let stranded = self.active_workers() == 0 && self.queued_tasks() > 0;
        !stranded && self.recent_crashes() <= self.crash_threshold
    }
}
