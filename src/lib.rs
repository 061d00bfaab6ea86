//! # FrameFlow-RS: Concurrent Frame Processing
//!
//! Turns raw device byte streams into typed dataset values. Buffers are
//! split into frames, integrity-checked, and parsed by user scripts running
//! in a sandbox, all on a pool of worker threads that survives crashing or
//! stalling workers.
//!
//! ## Architecture
//!
//! - **Framing**: Delimiter-based frame detection and checksum validation
//! - **Scripting**: Rhai parser scripts with operation and wall-clock budgets
//! - **Backend**: Worker pool with a single coordinator thread owning all pool state
//! - **Communication**: Crossbeam channels between threads, tokio oneshots to callers
//!
//! ## Configuration
//!
//! Processor configuration (worker settings, pool limits and the parser
//! script) is stored as TOML, by default in the platform config directory
//! under `dev.frameflow.frameflow-rs`.
//!
//! ## Example
//!
//! ```ignore
//! use frameflow_rs::{
//!     backend::WorkerPool,
//!     config::{PoolSettings, WorkerConfig},
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = WorkerPool::new(WorkerConfig::default(), PoolSettings::default())?;
//!     pool.load_script("fn parse(frame) { frame.split(\",\") }")?;
//!
//!     let results = pool
//!         .process_batch([b"1,2\n".to_vec(), b"3,4\n".to_vec()])
//!         .await;
//!     for result in results {
//!         println!("{:?}", result?.frames);
//!     }
//!
//!     pool.terminate().await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod framing;
pub mod scripting;
pub mod types;

// Re-export commonly used types
pub use backend::{ProcessorStatistics, TaskTicket, WorkerPool};
pub use config::{FrameDetection, OperationMode, PoolSettings, ProcessorConfig, WorkerConfig};
pub use error::{ProcessorError, Result};
pub use types::{DatasetValue, Frame, ParseResult, TaskOutput, TaskResult};
