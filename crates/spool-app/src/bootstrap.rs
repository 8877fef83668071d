//! Process wiring: configuration, logging, the application context and the
//! run and drain lifecycle.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use spool_config::{DownloadPolicy, LogOutput, LoggingSettings, SpoolConfig};
use spool_core::{DisplayMetadata, DownloadRequest, JobSource, OwnerId};
use spool_engine::{SessionEngine, SimulationProfile};
use spool_events::EventBus;
use spool_runtime::StateStore;
use spool_telemetry::{GlobalContextGuard, LogFormat, LoggingConfig, Metrics, init_logging};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::console::{LeaveInPlace, LogRenderer};
use crate::context::AppContext;
use crate::dispatch::DownloadQueue;
use crate::error::{AppError, AppResult};

#[derive(Debug, Parser)]
#[command(name = "spool", version, about = "Per-owner download spool")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon until interrupted, then drain.
    Run(RunArgs),
    /// Print the persisted state file as JSON.
    State,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    /// Owner that command-line jobs are queued for.
    #[arg(long, env = "SPOOL_OWNER", default_value_t = 0)]
    owner: i64,
    /// Magnet URI to queue; may be repeated.
    #[arg(long = "magnet")]
    magnets: Vec<String>,
    /// Metainfo file to queue; may be repeated.
    #[arg(long = "torrent")]
    torrents: Vec<PathBuf>,
    /// Destination directory instead of the configured default.
    #[arg(long)]
    save_path: Option<PathBuf>,
    /// Queue every source together as one season batch.
    #[arg(long)]
    batch: bool,
}

impl RunArgs {
    fn requests(&self, policy: &DownloadPolicy) -> Vec<DownloadRequest> {
        let owner = OwnerId(self.owner);
        let save_path = self
            .save_path
            .clone()
            .unwrap_or_else(|| policy.default_save_path.clone());
        let magnets = self.magnets.iter().map(JobSource::magnet);
        let torrents = self.torrents.iter().map(JobSource::torrent_file);
        magnets
            .chain(torrents)
            .map(|source| DownloadRequest {
                owner,
                source,
                save_path: save_path.clone(),
                display: DisplayMetadata::default(),
            })
            .collect()
    }
}

/// Entry point for the `spool` binary.
///
/// # Errors
///
/// Returns an error if configuration, logging or the selected command fails.
pub async fn run_app() -> AppResult<()> {
    let cli = Cli::parse();
    let config =
        spool_config::load_from_env().map_err(|err| AppError::config("config.load", err))?;
    match cli.command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Run(args) => run_daemon(config, &args).await,
        Command::State => {
            let rendered = render_state(&StateStore::new(config.state.path))?;
            writeln!(io::stdout().lock(), "{rendered}")
                .map_err(|err| AppError::io("state.print", err))
        }
    }
}

async fn run_daemon(config: SpoolConfig, args: &RunArgs) -> AppResult<()> {
    install_logging(&config.logging)?;
    let _context = GlobalContextGuard::new("run");
    info!(state = %config.state.path.display(), "spool starting");

    let metrics = Metrics::new().map_err(|err| AppError::telemetry("telemetry.metrics", err))?;
    let events = EventBus::new();
    let event_log = spawn_event_log(&events);
    let store = StateStore::new(config.state.path.clone());
    let ctx = AppContext {
        engine: Arc::new(SessionEngine::simulated(SimulationProfile::default())),
        renderer: Arc::new(LogRenderer),
        completion: Arc::new(LeaveInPlace),
        store: store.clone(),
        events,
        metrics: metrics.clone(),
        policy: config.downloads.clone(),
    };
    let queue = DownloadQueue::new(ctx);
    queue.resume_on_start(store.load());

    let outcome = serve(&queue, args, &config.downloads).await;
    queue.drain_on_shutdown().await;
    event_log.abort();

    match metrics.render() {
        Ok(text) => debug!(metrics = %text, "final metrics"),
        Err(err) => warn!(error = %err, "metrics encoding failed"),
    }
    info!("spool stopped");
    outcome
}

async fn serve(queue: &DownloadQueue, args: &RunArgs, policy: &DownloadPolicy) -> AppResult<()> {
    let requests = args.requests(policy);
    if args.batch && !requests.is_empty() {
        let receipt = queue
            .enqueue_batch(OwnerId(args.owner), requests)
            .map_err(|err| AppError::command("cli.enqueue_batch", err))?;
        info!(
            batch_id = %receipt.batch_id,
            jobs = receipt.job_ids.len(),
            position = receipt.first_position,
            "batch queued from command line"
        );
    } else {
        for request in requests {
            let receipt = queue
                .enqueue(request)
                .map_err(|err| AppError::command("cli.enqueue", err))?;
            info!(
                job_id = %receipt.job_id,
                position = receipt.position,
                "queued from command line"
            );
        }
    }
    tokio::signal::ctrl_c()
        .await
        .map_err(|err| AppError::io("signal.ctrl_c", err))?;
    info!("interrupt received");
    Ok(())
}

fn install_logging(settings: &LoggingSettings) -> AppResult<()> {
    let format = settings.format.map_or_else(LogFormat::infer, |output| match output {
        LogOutput::Json => LogFormat::Json,
        LogOutput::Pretty => LogFormat::Pretty,
    });
    let defaults = LoggingConfig::default();
    init_logging(&LoggingConfig {
        level: &settings.level,
        format,
        build_sha: defaults.build_sha,
    })
    .map_err(|err| AppError::telemetry("telemetry.init", err))
}

fn spawn_event_log(events: &EventBus) -> JoinHandle<()> {
    let mut stream = events.subscribe(None);
    tokio::spawn(async move {
        while let Some(envelope) = stream.next().await {
            debug!(
                event_id = envelope.id,
                kind = envelope.event.kind(),
                job_id = ?envelope.event.job_id(),
                "lifecycle event"
            );
        }
    })
}

fn render_state(store: &StateStore) -> AppResult<String> {
    let snapshot = store
        .read()
        .map_err(|err| AppError::runtime("state.read", err))?
        .unwrap_or_default();
    serde_json::to_string_pretty(&snapshot).map_err(|source| AppError::Serialize {
        operation: "state.encode",
        source,
    })
}
