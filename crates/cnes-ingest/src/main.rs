//! CNES Ingest - bulk establishment lookup tool

use anyhow::Result;
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use cnes_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use cnes_ingest::config::{
    parse_delay_secs, IngestConfig, DEFAULT_BASE_URL, DEFAULT_CHECKPOINT_EVERY, DEFAULT_CONCURRENCY,
    DEFAULT_JOIN_FIELD, DEFAULT_TIMEOUT_SECS,
};
use cnes_ingest::fetcher::HttpLookupClient;
use cnes_ingest::job::{enrich_checkpoint, IngestJob};
use cnes_ingest::progress::{ProgressObserver, SilentProgress, TerminalProgress};
use cnes_ingest::{input, reference};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status after a clean interruption (128 + SIGINT)
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "cnes-ingest")]
#[command(author, version, about = "Bulk CNES establishment lookup with health-region enrichment")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look up every code of an input file and write an enriched report
    Run(RunArgs),

    /// Enrich the successes stored in a checkpoint without querying the API
    Enrich {
        /// Checkpoint file written by an earlier run
        #[arg(long)]
        checkpoint: PathBuf,

        /// Municipality and health-region reference file
        #[arg(short, long, env = "CNES_REFERENCE")]
        reference: PathBuf,

        /// Report file
        #[arg(short, long)]
        output: PathBuf,

        /// Record attribute holding the municipality code
        #[arg(long, default_value = DEFAULT_JOIN_FIELD)]
        join_field: String,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON file with the CNES codes
    #[arg(short, long)]
    input: PathBuf,

    /// Municipality and health-region reference file
    #[arg(short, long, env = "CNES_REFERENCE")]
    reference: PathBuf,

    /// Report file [default: cnes_com_macrorregiao_<timestamp>.json]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Simultaneous lookups per wave
    #[arg(short, long, env = "CNES_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Pause between waves, in seconds
    #[arg(long, env = "CNES_DELAY", default_value = "0.3", value_parser = parse_delay_secs)]
    delay: Duration,

    /// Write a checkpoint every N waves
    #[arg(long, env = "CNES_CHECKPOINT_EVERY", default_value_t = DEFAULT_CHECKPOINT_EVERY)]
    checkpoint_every: usize,

    /// Directory for checkpoint files
    #[arg(long, env = "CNES_CHECKPOINT_DIR", default_value = ".")]
    checkpoint_dir: PathBuf,

    /// Lookup endpoint; the code is appended as a path segment
    #[arg(long, env = "CNES_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Per-request timeout, in seconds
    #[arg(long, env = "CNES_TIMEOUT", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Continue from a checkpoint of an interrupted run over the same input
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Disable the progress bar
    #[arg(long)]
    no_progress: bool,
}

enum Status {
    Completed,
    Interrupted,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let _guard = match LogConfig::builder()
        .level(log_level)
        .output(LogOutput::Both)
        .log_file_prefix("cnes-ingest")
        .filter_directives("hyper=warn,reqwest=warn")
        .build()
        .apply_env()
        .and_then(|config| init_logging(&config))
    {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            return ExitCode::FAILURE;
        },
    };

    let result = match cli.command {
        Command::Run(args) => run(args).await,
        Command::Enrich {
            checkpoint,
            reference: reference_path,
            output,
            join_field,
        } => reference::load_reference(&reference_path)
            .map_err(anyhow::Error::from)
            .and_then(|index| enrich_checkpoint(&checkpoint, &index, &join_field, &output))
            .map(|_| Status::Completed),
    };

    match result {
        Ok(Status::Completed) => ExitCode::SUCCESS,
        Ok(Status::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        },
    }
}

async fn run(args: RunArgs) -> Result<Status> {
    let config = IngestConfig::new()
        .with_concurrency(args.concurrency)
        .with_delay(args.delay)
        .with_checkpoint_every(args.checkpoint_every)
        .with_checkpoint_dir(args.checkpoint_dir)
        .with_base_url(args.base_url)
        .with_timeout(Duration::from_secs(args.timeout));

    // Both files are checked before the first request goes out
    let regions = reference::load_reference(&args.reference)?;
    let identifiers = input::load_identifiers(&args.input)?;
    let client = HttpLookupClient::new(&config.fetch, config.wave.concurrency)?;

    let output = args.output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "cnes_com_macrorregiao_{}.json",
            Local::now().format("%Y%m%d_%H%M%S")
        ))
    });

    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current wave");
            token.cancel();
        }
    });

    let mut observer: Box<dyn ProgressObserver> = if args.no_progress {
        Box::new(SilentProgress)
    } else {
        Box::new(TerminalProgress::new(identifiers.len() as u64, "Querying CNES API"))
    };

    let mut job = IngestJob::new(config, client).with_shutdown(shutdown);
    if let Some(checkpoint) = args.resume {
        job = job.with_resume(checkpoint);
    }

    let outcome = job
        .run(&identifiers, &regions, &output, observer.as_mut())
        .await?;

    if outcome.interrupted {
        info!(checkpoint = %outcome.checkpoint_path.display(), "Partial results kept in checkpoint");
        Ok(Status::Interrupted)
    } else {
        Ok(Status::Completed)
    }
}
