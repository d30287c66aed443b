//! Pairing and processing worker binary.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vpair_models::{PairId, VideoId};
use vpair_worker::{MediaService, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "vpair-worker")]
#[command(about = "Pairs raw videos and drives their processing pipeline")]
#[command(version)]
struct Cli {
    /// Worker pool size (overrides WORKER_POOL_SIZE)
    #[arg(short, long)]
    workers: Option<usize>,

    /// State file (overrides STATE_FILE)
    #[arg(long)]
    state_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Track video files and pair them by creation time
    Import { paths: Vec<PathBuf> },
    /// Process videos (pair members are processed together)
    Process { ids: Vec<String> },
    /// Print the tracked pairs and unpaired videos
    List,
    /// Pair two unpaired videos
    Pair { first: String, second: String },
    /// Dissolve a pair
    Unpair { pair_id: String },
    /// Stop tracking videos
    Remove { ids: Vec<String> },
    /// Run a raw process for one video under the supervisor
    Supervise {
        video_id: String,
        program: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Only run startup recovery
    Recover,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    if let Err(e) = run(Cli::parse()).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let mut env_filter = EnvFilter::from_default_env();
    for directive in ["vpair=info", "vpair_worker=info"] {
        match directive.parse() {
            Ok(d) => env_filter = env_filter.add_directive(d),
            Err(e) => eprintln!("Invalid log directive {}: {}", directive, e),
        }
    }

    // Logs go to stderr; stdout carries boundary events
    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr),
            )
            .with(env_filter)
            .init();
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = WorkerConfig::from_env();
    if let Some(workers) = cli.workers {
        config.pool_size = workers.max(1);
    }
    if let Some(state_file) = cli.state_file {
        config.state_file = state_file;
    }
    info!("Worker config: {:?}", config);

    let service = MediaService::from_config(config);
    let printer = tokio::spawn(print_events(service.subscribe()));

    let recovered = service.recover().await.context("startup recovery failed")?;
    if !recovered.orphaned.is_empty() {
        info!(count = recovered.orphaned.len(), "Recovered interrupted videos");
    }

    let outcome = execute(&service, cli.command).await;

    drop(service);
    if tokio::time::timeout(Duration::from_secs(2), printer).await.is_err() {
        warn!("Event printer did not finish in time");
    }
    outcome
}

async fn execute(service: &MediaService, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Import { paths } => {
            let report = service.import_videos(&paths).await?;
            for (path, reason) in &report.failed {
                warn!(path = %path.display(), "Not imported: {}", reason);
            }
            info!(added = report.added.len(), duplicates = report.duplicates.len(), "Import done");
        }
        Command::Process { ids } => {
            let ids: Vec<VideoId> = ids.into_iter().map(VideoId::from).collect();
            let report = service.process(&ids).await?;
            info!(
                succeeded = report.batch.results.len(),
                failed = report.batch.failures.len(),
                skipped = report.already_processing.len() + report.unknown.len(),
                "Processing done"
            );
        }
        Command::List => {
            let state = service.state().await?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Pair { first, second } => {
            let pair_id = service
                .pair_videos(&VideoId::from(first), &VideoId::from(second))
                .await?;
            info!(pair_id = %pair_id, "Paired");
        }
        Command::Unpair { pair_id } => {
            service.unpair(&PairId(pair_id)).await?;
        }
        Command::Remove { ids } => {
            let ids: Vec<VideoId> = ids.into_iter().map(VideoId::from).collect();
            let removed = service.remove_videos(&ids).await?;
            info!(count = removed.len(), "Removed videos");
        }
        Command::Supervise { video_id, program, args } => {
            let supervisor = service.supervisor();
            let process_id = supervisor.start(&VideoId::from(video_id), &program, &args).await?;
            info!(process_id = %process_id, "Supervising process");

            let job = tokio::select! {
                job = supervisor.wait(&process_id) => job,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    Some(supervisor.kill(&process_id).await?)
                }
            };
            if let Some(job) = job {
                println!("{}", serde_json::to_string(&job)?);
            }
        }
        Command::Recover => {}
    }
    Ok(())
}

/// Print boundary events as JSON lines until the service goes away.
async fn print_events(mut events: tokio::sync::broadcast::Receiver<vpair_models::BoundaryEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode event: {}", e),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event printer lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
