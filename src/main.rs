//! FrameFlow - Command Line Frame Processor
//!
//! Reads a byte stream from a file or stdin, pushes it through a worker
//! pool in chunks and prints one JSON line per frame.
//!
//! # Usage
//!
//! ```bash
//! # Comma separated lines from a serial capture
//! frameflow --mode quick-plot capture.bin
//!
//! # Project mode with a config file and parser script
//! frameflow --config frameflow.toml --script parser.rhai capture.bin
//!
//! # Check a parser script without processing anything
//! frameflow --script parser.rhai --validate
//! ```
//!
//! Each worker keeps its own accumulation buffer, so frames that straddle
//! chunk boundaries are only reassembled when a single worker sees every
//! chunk. The default of one worker keeps streams intact; raise `--workers`
//! when chunks hold whole frames.

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use frameflow_rs::{
    config::{default_config_path, OperationMode, ProcessorConfig},
    scripting::ScriptEngine,
    types::{FrameOutcome, TaskResult},
    WorkerPool,
};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// FrameFlow - Split, validate and parse device byte streams
#[derive(Parser, Debug)]
#[command(name = "frameflow")]
#[command(version)]
#[command(about = "Split, validate and parse device byte streams", long_about = None)]
struct Args {
    /// Input file; stdin when omitted
    #[arg(value_name = "INPUT")]
    input: Option<PathBuf>,

    /// Processor config file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Parser script, overriding the one in the config
    #[arg(short, long, value_name = "FILE")]
    script: Option<PathBuf>,

    /// Operation mode, overriding the one in the config
    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// Number of workers
    #[arg(short, long, default_value_t = 1)]
    workers: usize,

    /// Bytes read per task
    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: usize,

    /// Only check the parser script and exit
    #[arg(long)]
    validate: bool,

    /// Print pool statistics to stderr when done
    #[arg(long)]
    stats: bool,

    /// Also write logs to daily files in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Frames from the config, datasets from the parser script
    Project,
    /// JSON documents between start and finish sequences
    Json,
    /// Comma separated values, one frame per line
    QuickPlot,
}

impl From<ModeArg> for OperationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Project => OperationMode::ProjectFile,
            ModeArg::Json => OperationMode::DeviceSendsJson,
            ModeArg::QuickPlot => OperationMode::QuickPlot,
        }
    }
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "frameflow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,frameflow_rs=debug")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    guard
}

fn load_config(args: &Args) -> anyhow::Result<ProcessorConfig> {
    let mut config = match &args.config {
        Some(path) => ProcessorConfig::load(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => {
                tracing::info!("Using config {:?}", path);
                ProcessorConfig::load(&path)?
            }
            None => ProcessorConfig::default(),
        },
    };

    if let Some(mode) = args.mode {
        config.worker.operation_mode = mode.into();
    }
    if let Some(script) = &args.script {
        config.parser_script = None;
        config.parser_script_path = Some(script.clone());
    }
    config.worker.max_workers = Some(args.workers);
    config.validate()?;
    Ok(config)
}

fn print_outcome(outcome: &FrameOutcome) -> anyhow::Result<()> {
    let line = match &outcome.result {
        Ok(values) => serde_json::json!({
            "sequence": outcome.sequence,
            "timestamp": outcome.timestamp,
            "values": values,
        }),
        Err(e) => serde_json::json!({
            "sequence": outcome.sequence,
            "timestamp": outcome.timestamp,
            "error": e.to_string(),
        }),
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

fn report(result: TaskResult) -> anyhow::Result<()> {
    match result {
        Ok(output) => {
            if let Some(overflow) = &output.overflow {
                tracing::warn!("Input dropped: {}", overflow);
            }
            for outcome in &output.frames {
                print_outcome(outcome)?;
            }
        }
        Err(e) => tracing::warn!("Task failed: {}", e),
    }
    Ok(())
}

async fn run<R: AsyncRead + Unpin>(
    pool: &WorkerPool,
    mut input: R,
    chunk_size: usize,
) -> anyhow::Result<()> {
    let mut pending = VecDeque::new();
    let mut chunk = vec![0u8; chunk_size.max(1)];

    loop {
        let read = input.read(&mut chunk).await.context("Failed to read input")?;
        if read == 0 {
            break;
        }
        pending.push_back(pool.process_data(&chunk[..read]));

        // Print finished tasks in submission order without stalling the reader
        while pending.len() > pool.config().max_workers() * 2 {
            if let Some(ticket) = pending.pop_front() {
                report(ticket.await)?;
            }
        }
    }

    for ticket in pending {
        report(ticket.await)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_dir.as_ref());

    let config = load_config(&args)?;
    let script = config.parser_source()?;

    if args.validate {
        let Some(source) = script else {
            bail!("No parser script to validate");
        };
        let check = ScriptEngine::new().check_syntax(&source);
        match check.error {
            None => println!("Script OK"),
            Some(error) => bail!("Script invalid: {}", error),
        }
        return Ok(());
    }

    let pool = WorkerPool::new(config.worker.clone(), config.pool.clone())?;
    if let Some(source) = &script {
        pool.load_script(source)?;
    } else if config.worker.operation_mode == OperationMode::ProjectFile {
        tracing::warn!("No parser script loaded; frames will produce no values");
    }

    let result = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {:?}", path))?;
            run(&pool, file, args.chunk_size).await
        }
        None => run(&pool, tokio::io::stdin(), args.chunk_size).await,
    };

    pool.terminate().await;

    if args.stats {
        eprintln!("{}", serde_json::to_string_pretty(&pool.statistics())?);
    }
    result
}
