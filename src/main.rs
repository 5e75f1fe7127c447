use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tale_forge::models::JobStatus;
use tale_forge::{
    EngineConfig, FileStore, HttpLlmClient, InMemoryQueue, JobInput, Mode, Worker,
};
use tale_forge::worker::JobQueue;

/// Tale-Forge CLI: staged-agent novel generation with a persisted narrative state machine
#[derive(Parser, Debug)]
#[command(name = "tale-forge")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one book inline and exit
    #[command(name = "run")]
    Run {
        #[command(flatten)]
        args: Box<RunArgs>,
    },

    /// Consume the job queue until shutdown
    #[command(name = "worker")]
    Worker {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Enable verbose logging
        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Premise for the book
    #[arg(short, long)]
    prompt: String,

    /// Genre tag (e.g. "literary_fiction", "mystery")
    #[arg(short, long)]
    genre: String,

    /// Target manuscript length in words
    #[arg(short = 'w', long)]
    words: u32,

    /// Generation mode: draft skips the editor loop
    #[arg(short, long, default_value = "polished", value_parser = clap::value_parser!(Mode))]
    mode: Mode,

    /// Optional narration voice directive
    #[arg(long)]
    voice: Option<String>,

    /// Explicit job id (defaults to a timestamped one)
    #[arg(long)]
    job_id: Option<String>,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "tale_forge=debug,info" } else { "info" }));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

/// Resolve the configured queue endpoint. This binary only serves the
/// in-process queue; any other scheme is a startup failure, not a silent
/// fallback.
fn build_queue(config: &EngineConfig) -> Result<Arc<InMemoryQueue>> {
    let url = &config.worker.queue_url;
    if !url.starts_with("memory://") {
        anyhow::bail!("unsupported queue URL '{url}': this worker serves memory:// queues only");
    }
    Ok(Arc::new(InMemoryQueue::new()))
}

fn build_worker(config: EngineConfig, queue: Arc<InMemoryQueue>) -> Result<Worker> {
    let store = Arc::new(FileStore::new(config.storage.checkpoint_url.clone()));
    let llm = Arc::new(HttpLlmClient::new(&config.llm).context("constructing LLM client")?);
    Ok(Worker::new(queue, store.clone(), store, llm, config))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { args } => {
            init_tracing(args.verbose);
            let config = EngineConfig::load_with_env(args.config.as_ref())
                .context("loading configuration")?;
            config.validate_for_worker().context("startup validation")?;

            let job_id = args
                .job_id
                .clone()
                .unwrap_or_else(|| format!("job-{}", chrono::Utc::now().timestamp()));
            let input = JobInput {
                prompt: args.prompt.clone(),
                genre: args.genre.clone(),
                target_length_words: args.words,
                voice: args.voice.clone(),
                mode: args.mode,
            };

            let queue = build_queue(&config).context("resolving queue endpoint")?;
            queue
                .submit(&job_id, input)
                .await
                .context("enqueueing job")?;

            let storage_root = config.storage.checkpoint_url.clone();
            let worker = build_worker(config, queue.clone())?;
            worker.run_until_idle().await;

            let record = queue
                .record(&job_id)
                .await
                .context("reading job record")?
                .context("job record missing after run")?;
            match record.status {
                JobStatus::Succeeded => {
                    info!(%job_id, "{}", record.message);
                    println!(
                        "manuscript written to {}/manuscripts/{}.json",
                        storage_root, job_id
                    );
                    Ok(())
                }
                _ => anyhow::bail!(
                    "job {} failed: {}",
                    job_id,
                    record.error.unwrap_or_else(|| "unknown error".to_string())
                ),
            }
        }

        Command::Worker { config, verbose } => {
            init_tracing(verbose);
            let config =
                EngineConfig::load_with_env(config.as_ref()).context("loading configuration")?;
            config.validate_for_worker().context("startup validation")?;

            let queue = build_queue(&config).context("resolving queue endpoint")?;
            let worker = build_worker(config, queue)?;

            let shutdown = CancellationToken::new();
            let signal_token = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    signal_token.cancel();
                }
            });

            worker.run(shutdown).await;
            info!("worker stopped");
            Ok(())
        }
    }
}
