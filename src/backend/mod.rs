//! Backend module for concurrent frame processing
//!
//! All frame work happens on worker threads so that callers only ever
//! submit buffers and await results. Workers and the coordinator talk over
//! crossbeam channels; callers get tokio oneshot-backed tickets.
//!
//! # Architecture
//!
//! - [`WorkerPool`] - Caller-facing handle; validates requests and forwards them
//! - [`coordinator`] - Single thread owning the task queue, worker records and statistics
//! - [`Worker`] - One OS thread per worker, running tasks through its [`TaskProcessor`]
//! - [`FrameProcessor`] - Frame detection, checksum validation and parsing for one worker
//! - [`StatisticsTracker`] - Shared counters and the health verdict
//!
//! # Example
//!
//! ```ignore
//! use frameflow_rs::backend::WorkerPool;
//! use frameflow_rs::config::{PoolSettings, WorkerConfig};
//!
//! let pool = WorkerPool::new(WorkerConfig::quick_plot(), PoolSettings::default())?;
//!
//! let output = pool.process_data(b"1,2,3\n".to_vec()).await?;
//! for values in output.datasets() {
//!     println!("{:?}", values);
//! }
//!
//! pool.terminate().await;
//! ```

pub mod coordinator;
pub mod pool;
pub mod processor;
pub mod stats;
pub mod worker;

pub use coordinator::WorkerState;
pub use pool::{BatchTicket, TaskTicket, WorkerPool};
pub use processor::{default_factory, FrameProcessor, ProcessorFactory, TaskProcessor};
pub use stats::{ProcessorStatistics, StatisticsTracker};
pub use worker::{Worker, WorkerCommand, WorkerEvent};
