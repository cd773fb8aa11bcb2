//! Shared harness for reconciler integration tests: an in-memory cluster
//! wired to a controller over a tempdir module tree, with recording test
//! doubles for the host seams.

#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use semver::Version;
use tempfile::TempDir;
use tokio::sync::watch;

use modlink_core::cluster::{MemoryCluster, ReleaseStore};
use modlink_core::queue::{QueueRateLimiter, WorkQueue};
use modlink_core::release::predictor::PromoteAlways;
use modlink_core::release::{ModuleRelease, ModuleReleaseSpec, ModuleSource, Phase};
use modlink_daemon::controller::{ControllerDeps, ModuleReleaseController};
use modlink_daemon::debouncer::{RestartDebouncer, DEFAULT_DEBOUNCE_WINDOW};
use modlink_daemon::host::{
    ConfigService, DownloadError, DownloaderFactory, MemoryConfigService, ModuleDownloader,
    RestartSignaler,
};
use modlink_daemon::materializer::Materializer;

/// Counts restart signals instead of delivering them.
#[derive(Debug, Default)]
pub struct CountingSignaler {
    sent: AtomicUsize,
}

impl CountingSignaler {
    pub fn count(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }
}

impl RestartSignaler for CountingSignaler {
    fn signal_restart(&self) -> io::Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records download requests; optionally materializes the payload so the
/// following symlink restore can succeed.
#[derive(Debug)]
pub struct RecordingDownloaderFactory {
    create_payload: bool,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingDownloaderFactory {
    pub fn new(create_payload: bool) -> Self {
        Self {
            create_payload,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

impl DownloaderFactory for RecordingDownloaderFactory {
    fn for_source(&self, root: &Path, _source: &ModuleSource) -> Box<dyn ModuleDownloader> {
        Box::new(RecordingDownloader {
            root: root.to_path_buf(),
            create_payload: self.create_payload,
            calls: Arc::clone(&self.calls),
        })
    }
}

struct RecordingDownloader {
    root: std::path::PathBuf,
    create_payload: bool,
    calls: Arc<Mutex<Vec<(String, String)>>>,
}

impl ModuleDownloader for RecordingDownloader {
    fn download(&self, module: &str, version: &str) -> Result<(), DownloadError> {
        self.calls
            .lock()
            .push((module.to_string(), version.to_string()));
        if self.create_payload {
            fs::create_dir_all(self.root.join(module).join(version)).map_err(|e| {
                DownloadError::Io {
                    context: "creating the downloaded payload".to_string(),
                    source: e,
                }
            })
        } else {
            Err(DownloadError::Fetch {
                module: module.to_string(),
                version: version.to_string(),
                reason: "download disabled in this harness".to_string(),
            })
        }
    }
}

pub struct Harness {
    pub root: TempDir,
    pub cluster: Arc<MemoryCluster>,
    pub controller: Arc<ModuleReleaseController>,
    pub queue: Arc<WorkQueue>,
    pub materializer: Materializer,
    pub signals: Arc<CountingSignaler>,
    pub config_service: Arc<MemoryConfigService>,
    pub downloads: Arc<RecordingDownloaderFactory>,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    /// Builds the harness; downloads fail unless `downloads_succeed`.
    pub fn new(downloads_succeed: bool) -> Self {
        let root = TempDir::new().expect("temp modules root");
        let materializer = Materializer::new(root.path());
        materializer.ensure_layout().expect("modules layout");

        let cluster = Arc::new(MemoryCluster::new());
        let queue = WorkQueue::new(QueueRateLimiter::with_defaults());
        let debouncer = Arc::new(RestartDebouncer::new(DEFAULT_DEBOUNCE_WINDOW));
        let signals = Arc::new(CountingSignaler::default());
        let config_service = Arc::new(MemoryConfigService::default());
        let downloads = Arc::new(RecordingDownloaderFactory::new(downloads_succeed));

        let controller = ModuleReleaseController::new(
            ControllerDeps {
                releases: cluster.clone(),
                sources: cluster.clone(),
                materializer: materializer.clone(),
                debouncer: Arc::clone(&debouncer),
                policy: Arc::new(PromoteAlways),
                config_service: Arc::clone(&config_service) as Arc<dyn ConfigService>,
                documentation: Arc::new(modlink_daemon::host::NoopDocumentationPublisher),
                downloader: Arc::clone(&downloads) as Arc<dyn DownloaderFactory>,
            },
            Arc::clone(&queue),
        );

        {
            let hook = Arc::clone(&controller);
            cluster.subscribe(Box::new(move |event| hook.handle_event(event)));
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        {
            let debouncer = Arc::clone(&debouncer);
            let signals = Arc::clone(&signals);
            tokio::spawn(async move { debouncer.run(signals.as_ref(), shutdown_rx).await });
        }

        Self {
            root,
            cluster,
            controller,
            queue,
            materializer,
            signals,
            config_service,
            downloads,
            shutdown,
        }
    }

    pub fn create_source(&self, name: &str) -> ModuleSource {
        self.cluster.create_source(ModuleSource::new(name))
    }

    /// Creates a release record named `<module>-<version>`; the resulting
    /// cache event enqueues it.
    pub fn create_release(&self, module: &str, version: &str, weight: u32, source: &str) -> String {
        let name = format!("{module}-{version}");
        self.cluster.create_release(ModuleRelease::new(
            name.clone(),
            ModuleReleaseSpec {
                module_name: module.to_string(),
                version: Version::parse(version).expect("test version"),
                weight,
                module_source: source.to_string(),
            },
        ));
        name
    }

    /// Creates a release already carrying a phase, the way a previous run of
    /// the reconciler would have left it.
    pub fn create_release_with_phase(
        &self,
        module: &str,
        version: &str,
        weight: u32,
        source: &str,
        phase: Phase,
    ) -> String {
        let name = format!("{module}-{version}");
        let mut release = ModuleRelease::new(
            name.clone(),
            ModuleReleaseSpec {
                module_name: module.to_string(),
                version: Version::parse(version).expect("test version"),
                weight,
                module_source: source.to_string(),
            },
        );
        release.set_phase(phase);
        self.cluster.create_release(release);
        name
    }

    pub fn seed_payload(&self, module: &str, version: &str) {
        fs::create_dir_all(self.materializer.payload_dir(module, version)).expect("payload dir");
    }

    pub fn release(&self, name: &str) -> ModuleRelease {
        self.cluster.get(name).expect("release exists")
    }

    /// Processes queued keys synchronously until the queue is quiet.
    pub fn drain(&self) {
        for _ in 0..200 {
            let Some(key) = self.queue.try_get() else {
                return;
            };
            match self.controller.reconcile(&key) {
                Ok(_) => self.queue.forget(&key),
                Err(err) => panic!("reconcile of {key} failed: {err}"),
            }
            self.queue.done(&key);
        }
        panic!("reconciliation did not converge");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
