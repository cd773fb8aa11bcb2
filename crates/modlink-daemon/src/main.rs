//! modlink-daemon - reconciles module releases onto the host filesystem.
//!
//! The daemon loads the manifest directory, runs the preflight pass, then
//! starts the reconcile workers, the manifest poller, and the restart
//! debouncer. It runs in the foreground as a supervised child of the host
//! process; the host is told to reload through SIGUSR2 to PID 1.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use modlink_core::cluster::ReleaseStore;
use modlink_core::queue::{QueueRateLimiter, WorkQueue};
use modlink_core::release::predictor::PromoteAlways;
use modlink_daemon::config::{ReconcilerConfig, EXTERNAL_MODULES_DIR_ENV};
use modlink_daemon::controller::{ControllerDeps, ModuleReleaseController};
use modlink_daemon::debouncer::RestartDebouncer;
use modlink_daemon::host::{
    HostProcessSignaler, MemoryConfigService, NoDownloader, NoopDocumentationPublisher,
};
use modlink_daemon::materializer::Materializer;
use modlink_daemon::statedir::StateDirCluster;

/// modlink daemon - module release reconciler
#[derive(Parser, Debug)]
#[command(name = "modlink-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory of release and source manifests (the control plane).
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,

    /// Number of reconcile workers.
    #[arg(long, default_value_t = 3)]
    workers: usize,

    /// Interval between manifest directory scans.
    #[arg(long, default_value = "15s", value_parser = humantime::parse_duration)]
    poll_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout.
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = ReconcilerConfig::from_env();
    config.workers = args.workers;
    config.poll_interval = args.poll_interval;

    let Some(root) = config.external_modules_dir.clone() else {
        info!("env: {EXTERNAL_MODULES_DIR_ENV} is empty, not reconciling module releases");
        return Ok(());
    };

    info!(
        modules_dir = %root.display(),
        state_dir = %args.state_dir.display(),
        "starting modlink daemon"
    );

    let cluster = StateDirCluster::open(&args.state_dir).context("opening the state directory")?;
    let materializer = Materializer::new(&root);
    let queue = WorkQueue::new(QueueRateLimiter::with_defaults());
    let debouncer = Arc::new(RestartDebouncer::new(config.debounce_window));

    let controller = ModuleReleaseController::new(
        ControllerDeps {
            releases: cluster.clone(),
            sources: cluster.clone(),
            materializer,
            debouncer: Arc::clone(&debouncer),
            policy: Arc::new(PromoteAlways),
            config_service: Arc::new(MemoryConfigService::default()),
            documentation: Arc::new(NoopDocumentationPublisher),
            downloader: Arc::new(NoDownloader),
        },
        Arc::clone(&queue),
    );

    // The filesystem must agree with the control plane before any worker
    // accepts work.
    controller
        .run_preflight()
        .context("preflight synchronization")?;

    // Surface cache events into the queue, then enqueue the current listing
    // the way an informer replays its initial state.
    {
        let hook = Arc::clone(&controller);
        cluster.subscribe(Box::new(move |event| hook.handle_event(event)));
    }
    for release in cluster.list_all().context("listing module releases")? {
        queue.add(release.name());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let debounce_task = {
        let debouncer = Arc::clone(&debouncer);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { debouncer.run(&HostProcessSignaler, shutdown).await })
    };
    let poller_task = tokio::spawn(
        Arc::clone(&cluster).run_poller(config.poll_interval, shutdown_rx.clone()),
    );
    let signal_task = tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });

    controller.run(config.workers, shutdown_rx).await;

    let _ = tokio::join!(debounce_task, poller_task, signal_task);
    info!("modlink daemon stopped");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("opening the log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}
