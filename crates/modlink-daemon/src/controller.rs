//! The module release reconciler.
//!
//! One reconcile pass owns a single release key; the work queue guarantees
//! the same key is never processed by two workers at once, so per-release
//! logic needs no locking. A pass recomputes everything from scratch, which
//! keeps recovery idempotent: status writes, finalizer writes, and filesystem
//! changes are not transactional, and a crash between them is healed by the
//! next pass.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use modlink_core::cluster::{ClusterError, ReleaseEvent, ReleaseStore, SourceStore};
use modlink_core::queue::{ReconcileResult, WorkQueue};
use modlink_core::release::predictor::{PromotePolicy, ReleasePredictor};
use modlink_core::release::{
    sort_by_version, ModuleRelease, Phase, FS_RELEASE_FINALIZER, MODULE_LABEL,
    SOURCE_RELEASE_FINALIZER, STATUS_LABEL,
};

use crate::debouncer::RestartDebouncer;
use crate::host::{ConfigService, DocumentationPublisher, DownloaderFactory};
use crate::materializer::{MaterializeError, Materializer};

/// Restart reason recorded when a missing symlink was restored.
const REASON_MODULE_NOT_ENABLED: &str = "one of modules is not enabled";

/// Restart reason recorded when a new release was promoted.
const REASON_NEW_RELEASE: &str = "a new module release found";

/// Errors from a reconcile pass. Every variant is transient: the worker logs
/// it and requeues the key with backoff.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ReconcileError {
    /// A control-plane read or write failed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A filesystem operation failed.
    #[error(transparent)]
    Materialize(#[from] MaterializeError),
}

/// Collaborators injected into the controller.
pub struct ControllerDeps {
    /// Release cache and client.
    pub releases: Arc<dyn ReleaseStore>,
    /// Source cache and client.
    pub sources: Arc<dyn SourceStore>,
    /// Filesystem materializer rooted at the external modules directory.
    pub materializer: Materializer,
    /// Restart signal coalescer.
    pub debouncer: Arc<RestartDebouncer>,
    /// Promotion gate for pending releases.
    pub policy: Arc<dyn PromotePolicy + Send + Sync>,
    /// Host configuration service.
    pub config_service: Arc<dyn ConfigService>,
    /// Documentation publisher seam.
    pub documentation: Arc<dyn DocumentationPublisher>,
    /// Downloader factory, used by preflight to restore absent payloads.
    pub downloader: Arc<dyn DownloaderFactory>,
}

/// Reconciles module releases onto the filesystem.
pub struct ModuleReleaseController {
    pub(crate) releases: Arc<dyn ReleaseStore>,
    pub(crate) sources: Arc<dyn SourceStore>,
    pub(crate) materializer: Materializer,
    pub(crate) downloader: Arc<dyn DownloaderFactory>,
    debouncer: Arc<RestartDebouncer>,
    policy: Arc<dyn PromotePolicy + Send + Sync>,
    config_service: Arc<dyn ConfigService>,
    documentation: Arc<dyn DocumentationPublisher>,
    queue: Arc<WorkQueue>,
    source_index: RwLock<HashMap<String, String>>,
}

impl ModuleReleaseController {
    /// Creates a controller draining the given queue.
    #[must_use]
    pub fn new(deps: ControllerDeps, queue: Arc<WorkQueue>) -> Arc<Self> {
        Arc::new(Self {
            releases: deps.releases,
            sources: deps.sources,
            materializer: deps.materializer,
            downloader: deps.downloader,
            debouncer: deps.debouncer,
            policy: deps.policy,
            config_service: deps.config_service,
            documentation: deps.documentation,
            queue,
            source_index: RwLock::new(HashMap::new()),
        })
    }

    /// The queue feeding this controller.
    #[must_use]
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Snapshot copy of the `module → source` index. Readers from other
    /// subsystems get a point-in-time view, never a partially updated map.
    #[must_use]
    pub fn module_sources(&self) -> HashMap<String, String> {
        self.source_index.read().clone()
    }

    /// Cache event hook: enqueues the release key. Periodic resync replays
    /// unchanged records; those are filtered out by resource version to avoid
    /// no-op churn.
    pub fn handle_event(&self, event: &ReleaseEvent) {
        if let ReleaseEvent::Updated { old, new } = event {
            if old.meta.resource_version == new.meta.resource_version {
                return;
            }
        }
        debug!(release = event.release_name(), "enqueueing module release");
        self.queue.add(event.release_name());
    }

    /// Runs `workers` reconcile workers until `shutdown` flips to true, then
    /// drains the queue and joins them.
    pub async fn run(self: Arc<Self>, workers: usize, mut shutdown: watch::Receiver<bool>) {
        info!(workers, "starting module release workers");
        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            handles.push(tokio::spawn(Arc::clone(&self).run_worker(worker)));
        }

        let _ = shutdown.wait_for(|stop| *stop).await;
        self.queue.shut_down();
        for handle in handles {
            let _ = handle.await;
        }
        info!("module release workers stopped");
    }

    async fn run_worker(self: Arc<Self>, worker: usize) {
        while let Some(key) = self.queue.get().await {
            self.process(&key);
        }
        debug!(worker, "reconcile worker stopped");
    }

    /// Handles one dequeued key: reconcile, then requeue or forget.
    pub(crate) fn process(&self, key: &str) {
        match self.reconcile(key) {
            Ok(result) => {
                if let Some(delay) = result.requeue_after {
                    self.queue.add_after(key, delay);
                } else if result.requeue {
                    self.queue.add_rate_limited(key);
                } else {
                    self.queue.forget(key);
                }
            }
            Err(err) => {
                error!(release = key, %err, "module release reconcile failed");
                self.queue.add_rate_limited(key);
            }
        }
        self.queue.done(key);
    }

    /// Reconciles one release by name. A missing release is success: the key
    /// is dropped silently.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] on transient control-plane or filesystem
    /// failures; the caller requeues with backoff.
    pub fn reconcile(&self, name: &str) -> Result<ReconcileResult, ReconcileError> {
        let release = match self.releases.get(name) {
            Ok(release) => release,
            Err(err) if err.is_not_found() => return Ok(ReconcileResult::done()),
            Err(err) => return Err(err.into()),
        };

        if release.is_deleting() {
            self.reconcile_deleted(&release)
        } else {
            self.reconcile_live(&release)
        }
    }

    /// Delete branch: clean the filesystem, then release the fs finalizer so
    /// the record can go away. Safe to run twice; payload and symlink
    /// removal are idempotent.
    fn reconcile_deleted(&self, release: &ModuleRelease) -> Result<ReconcileResult, ReconcileError> {
        let module = &release.spec.module_name;
        let version = release.spec.version.to_string();
        self.materializer.purge_payload(module, &version)?;

        if release.phase() == Some(Phase::Deployed) {
            let symlink = self.materializer.symlink_path(release.spec.weight, module);
            self.materializer.disable(&symlink)?;
        }

        if release.meta.has_finalizer(FS_RELEASE_FINALIZER) {
            let mut updated = release.clone();
            updated.meta.remove_finalizer(FS_RELEASE_FINALIZER);
            self.releases.update(&updated)?;
            info!(release = release.name(), %module, "module release cleaned up");
        }
        Ok(ReconcileResult::done())
    }

    fn reconcile_live(&self, release: &ModuleRelease) -> Result<ReconcileResult, ReconcileError> {
        match release.phase() {
            None => {
                let mut updated = release.clone();
                updated.mark_pending();
                self.releases.update_status(&updated)?;
                // The status event re-enters reconcile for the pending pass.
                Ok(ReconcileResult::done())
            }
            Some(phase @ (Phase::Superseded | Phase::Suspended)) => {
                let mut updated = release.clone();
                if updated.meta.set_label(STATUS_LABEL, phase.status_label()) {
                    self.releases.update(&updated)?;
                }
                Ok(ReconcileResult::done())
            }
            Some(Phase::Deployed) => {
                self.ensure_deployed_metadata(release)?;
                if self.deployed_payload_linked(release) {
                    Ok(ReconcileResult::done())
                } else {
                    // The symlink disappeared out-of-band; the convergence
                    // pass restores it.
                    self.reconcile_pending(release)
                }
            }
            Some(Phase::Pending) => self.reconcile_pending(release),
        }
    }

    /// Deployed releases carry the fs finalizer and status label, and pin
    /// their source with the release-exists finalizer.
    fn ensure_deployed_metadata(&self, release: &ModuleRelease) -> Result<(), ReconcileError> {
        let mut updated = release.clone();
        let finalizer_added = updated.meta.add_finalizer(FS_RELEASE_FINALIZER);
        let label_changed = updated
            .meta
            .set_label(STATUS_LABEL, Phase::Deployed.status_label());
        if finalizer_added || label_changed {
            self.releases.update(&updated)?;
        }

        let mut source = self.sources.get_source(&release.spec.module_source)?;
        if source.meta.add_finalizer(SOURCE_RELEASE_FINALIZER) {
            self.sources.update_source(&source)?;
        }
        Ok(())
    }

    fn deployed_payload_linked(&self, release: &ModuleRelease) -> bool {
        let module = &release.spec.module_name;
        let Some(symlink) = self.materializer.find_current_symlink(module) else {
            return false;
        };
        let target =
            Materializer::relative_payload_path(module, &release.spec.version.to_string());
        self.materializer.is_payload_linked(&symlink, &target)
    }

    /// Pending convergence: decide the desired version among all releases of
    /// the module and transition filesystem and phases to match. The old
    /// current release is demoted before the new desired one is promoted;
    /// a module must never expose two deployed releases, even transiently.
    fn reconcile_pending(&self, release: &ModuleRelease) -> Result<ReconcileResult, ReconcileError> {
        let module = release.spec.module_name.clone();
        let mut siblings = self.releases.list_labelled(MODULE_LABEL, &module)?;
        sort_by_version(&mut siblings);

        let prediction = ReleasePredictor::new(&siblings, self.policy.as_ref()).calculate();
        let current_symlink = self.materializer.current_or_fallback(&module);
        let mut restart_reason = None;

        if prediction.current_is_latest(siblings.len()) {
            // The deployed release is already the newest; make sure it is
            // actually enabled on the filesystem.
            let deployed = &siblings[siblings.len() - 1];
            self.register_module_source(&module, &deployed.spec.module_source);

            let target =
                Materializer::relative_payload_path(&module, &deployed.spec.version.to_string());
            if !self.materializer.is_payload_linked(&current_symlink, &target) {
                debug!(%module, "module is not enabled on the filesystem, restoring");
                let new_symlink = self
                    .materializer
                    .symlink_path(deployed.spec.weight, &module);
                if let Err(err) =
                    self.materializer
                        .enable(Some(&current_symlink), &new_symlink, &target)
                {
                    error!(%module, %err, "module restore failed");
                    self.suspend_release(deployed, &err)?;
                    return Err(err.into());
                }
                restart_reason = Some(REASON_MODULE_NOT_ENABLED);
            }
        }

        for &index in &prediction.skipped_patches {
            let mut skipped = siblings[index].clone();
            skipped.mark_superseded();
            self.releases.update_status(&skipped)?;
        }

        if prediction.desired_index.is_some() {
            if let Some(current) = prediction.current_index {
                let mut superseded = siblings[current].clone();
                superseded.mark_superseded();
                self.releases.update_status(&superseded)?;
            }
        }

        if let Some(index) = prediction.desired_index {
            let desired = &siblings[index];
            let version = desired.spec.version.to_string();
            let target = Materializer::relative_payload_path(&module, &version);
            let new_symlink = self.materializer.symlink_path(desired.spec.weight, &module);

            match self
                .materializer
                .enable(Some(&current_symlink), &new_symlink, &target)
            {
                Err(err) => {
                    warn!(%module, release = desired.name(), %err, "module deploy failed");
                    // Suspended releases rest until their next event.
                    self.suspend_release(desired, &err)?;
                }
                Ok(()) => {
                    let mut deployed = desired.clone();
                    deployed.mark_deployed();
                    self.documentation
                        .publish(&self.materializer.payload_dir(&module, &version));
                    self.releases.update_status(&deployed)?;
                    self.register_module_source(&module, &desired.spec.module_source);
                    info!(%module, %version, "module release deployed");
                    restart_reason = Some(REASON_NEW_RELEASE);
                }
            }
        }

        if let Some(reason) = restart_reason {
            self.debouncer.emit_restart(reason);
        }
        Ok(ReconcileResult::done())
    }

    /// Moves a release to Suspended with a human-readable diagnostic.
    fn suspend_release(
        &self,
        release: &ModuleRelease,
        cause: &MaterializeError,
    ) -> Result<(), ReconcileError> {
        let mut suspended = release.clone();
        suspended.mark_suspended(&format!(
            "Desired version of the module met problems: {cause}"
        ));
        self.releases.update_status(&suspended)?;
        Ok(())
    }

    pub(crate) fn register_module_source(&self, module: &str, source: &str) {
        self.config_service.add_module_name_to_source(module, source);
        self.index_module_source(module, source);
    }

    pub(crate) fn index_module_source(&self, module: &str, source: &str) {
        self.source_index
            .write()
            .insert(module.to_string(), source.to_string());
    }
}
