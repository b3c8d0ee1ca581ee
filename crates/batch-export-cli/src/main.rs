//! batch-export CLI - parameterized export of relational rows to TSV files.

use batch_export::state::LoggingListener;
use batch_export::{
    BatchStatus, Config, ExecutionStore, ExportError, JobExecution, JobTracker, PageSource,
    SqlSource,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Interval between status checks while waiting for a job.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "batch-export")]
#[command(about = "Parameterized batch export of relational rows to tab-delimited files")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Path to JSON file holding job execution records
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP control surface
    Serve {
        /// Override listen address (host:port)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Run one export and wait for it to finish
    Run {
        /// Filter replacing the configured default where clause
        #[arg(long)]
        where_clause: Option<String>,

        /// Output filename inside the configured directory
        #[arg(long)]
        filename: Option<String>,

        /// Override rows per committed chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Override rows per fetched page
        #[arg(long)]
        page_size: Option<usize>,
    },

    /// Test the data source connection
    HealthCheck,

    /// List recorded job executions
    Jobs,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<ExitCode, ExportError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format).map_err(ExportError::Config)?;

    let mut config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    if let Some(path) = &cli.state_file {
        config.tracker.state_file = Some(path.clone());
    }

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
                config.validate()?;
            }

            let cancel_token = setup_signal_handler().await?;
            let tracker = build_tracker(&config).await?;
            batch_export::api::serve(&config.server.bind, tracker, cancel_token).await?;
            info!("Server stopped");
        }

        Commands::Run {
            where_clause,
            filename,
            chunk_size,
            page_size,
        } => {
            if let Some(size) = chunk_size {
                config.batch.chunk_size = size;
            }
            if let Some(size) = page_size {
                config.batch.page_size = size;
            }
            config.validate()?;

            let cancel_token = setup_signal_handler().await?;
            let tracker = build_tracker(&config).await?;
            let started = tracker
                .launch(where_clause.as_deref(), filename.as_deref())
                .await?;
            let record = wait_for_job(&tracker, started, &cancel_token).await;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_execution(&record);
            }

            if record.status != BatchStatus::Completed {
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::HealthCheck => {
            let started = Instant::now();
            let source = SqlSource::connect(&config.source).await?;
            source.health_check().await?;
            let latency_ms = started.elapsed().as_millis() as u64;

            if cli.output_json {
                let result = serde_json::json!({
                    "healthy": true,
                    "dbType": source.db_type(),
                    "latencyMs": latency_ms,
                });
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Health Check Results:");
                println!(
                    "  Source ({}): OK ({}ms)",
                    source.db_type(),
                    latency_ms
                );
            }
        }

        Commands::Jobs => {
            let path = config.tracker.state_file.clone().ok_or_else(|| {
                ExportError::Config(
                    "--state-file or tracker.state_file is required to list jobs".to_string(),
                )
            })?;
            let records = ExecutionStore::load_snapshot(&path).await?;

            if cli.output_json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No job executions recorded");
            } else {
                for record in &records {
                    println!(
                        "{:>6}  {:<9}  {}  {}",
                        record.job_id,
                        record.status,
                        record.start_time.to_rfc3339(),
                        record.parameters.output_path
                    );
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn build_tracker(config: &Config) -> Result<Arc<JobTracker>, ExportError> {
    let store = match &config.tracker.state_file {
        Some(path) => ExecutionStore::open(path).await?,
        None => ExecutionStore::new(),
    };
    let source = SqlSource::connect(&config.source).await?;
    let tracker = JobTracker::new(&config.batch, Arc::new(source), Arc::new(store))?
        .with_listener(Arc::new(LoggingListener));
    Ok(Arc::new(tracker))
}

/// Poll until the job is terminal, asking it to stop once on shutdown.
async fn wait_for_job(
    tracker: &JobTracker,
    started: JobExecution,
    cancel_token: &CancellationToken,
) -> JobExecution {
    let job_id = started.job_id;
    let mut latest = started;
    let mut stop_sent = false;

    loop {
        if let Some(record) = tracker.status(job_id).await {
            latest = record;
        }
        if !latest.is_running() {
            return latest;
        }

        tokio::select! {
            _ = cancel_token.cancelled(), if !stop_sent => {
                tracker.stop(job_id).await;
                stop_sent = true;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

fn print_execution(record: &JobExecution) {
    println!("\nJob {} {}", record.job_id, record.status);
    println!("  Run ID: {}", record.parameters.run_id);
    println!("  Output: {}", record.parameters.output_path);
    println!("  Rows: {}", record.rows_written);
    if let Some(end) = record.end_time {
        let elapsed = end - record.start_time;
        println!(
            "  Duration: {:.2}s",
            elapsed.num_milliseconds() as f64 / 1000.0
        );
    }
    println!("  Exit code: {}", record.exit_status.exit_code);
    if !record.exit_status.exit_description.is_empty() {
        println!("  Exit description: {}", record.exit_status.exit_description);
    }
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "info" => "info",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };

    // RUST_LOG wins over --verbosity when set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    if format == "json" {
        subscriber.json().try_init().map_err(|e| e.to_string())
    } else {
        subscriber.try_init().map_err(|e| e.to_string())
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
async fn setup_signal_handler() -> Result<CancellationToken, ExportError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let token_int = cancel_token.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        eprintln!("\nReceived SIGINT. Stopping at the next chunk boundary...");
        token_int.cancel();
    });

    let token_term = cancel_token.clone();
    tokio::spawn(async move {
        sigterm.recv().await;
        eprintln!("\nReceived SIGTERM. Stopping at the next chunk boundary...");
        token_term.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
async fn setup_signal_handler() -> Result<CancellationToken, ExportError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl-C. Stopping at the next chunk boundary...");
            token.cancel();
        }
    });

    Ok(cancel_token)
}
