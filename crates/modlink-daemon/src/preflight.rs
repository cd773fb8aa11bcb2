//! Boot-time synchronization of the filesystem with the control plane.
//!
//! Runs once before any worker accepts work. Two passes: deployed releases
//! whose symlink is gone are re-downloaded and re-linked, and symlinks whose
//! module has no release at all are purged. The pass also rebuilds the
//! `module → source` index consulted by neighbouring subsystems.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use modlink_core::release::Phase;

use crate::controller::{ModuleReleaseController, ReconcileError};
use crate::materializer::{MaterializeError, Materializer};

impl ModuleReleaseController {
    /// Brings the modules root into agreement with the control plane.
    ///
    /// Per-release failures (absent source, failed download, failed link)
    /// are logged and skipped; the worker loop retries them through normal
    /// events. Listing failures abort preflight.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when the control plane cannot be listed or
    /// the symlinks directory cannot be read.
    pub fn run_preflight(&self) -> Result<(), ReconcileError> {
        self.materializer.ensure_layout()?;
        self.restore_absent_modules()?;
        self.purge_orphan_symlinks()
    }

    /// Re-downloads and re-links deployed releases absent from the
    /// filesystem.
    fn restore_absent_modules(&self) -> Result<(), ReconcileError> {
        let releases = self.releases.list_all()?;
        for release in releases
            .iter()
            .filter(|r| r.phase() == Some(Phase::Deployed))
        {
            let module = &release.spec.module_name;
            let symlink = self.materializer.symlink_path(release.spec.weight, module);
            if fs::symlink_metadata(&symlink).is_ok() {
                continue;
            }

            let version = format!("v{}", release.spec.version);
            info!(
                %module,
                %version,
                source = %release.spec.module_source,
                "module is absent on the filesystem, restoring from its source"
            );

            let source = match self.sources.get_source(&release.spec.module_source) {
                Ok(source) => source,
                Err(err) if err.is_not_found() => {
                    warn!(
                        %module,
                        source = %release.spec.module_source,
                        "module source is absent, skipping restore"
                    );
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let downloader = self
                .downloader
                .for_source(self.materializer.root(), &source);
            if let Err(err) = downloader.download(module, &version) {
                warn!(%module, %version, %err, "module download failed, skipping");
                continue;
            }

            let target =
                Materializer::relative_payload_path(module, &release.spec.version.to_string());
            if let Err(err) = self.materializer.enable(None, &symlink, &target) {
                warn!(%module, %err, "restoring the module symlink failed, skipping");
                continue;
            }
            info!(%module, %version, "module restored");
        }
        Ok(())
    }

    /// Removes enable symlinks whose module has no release in the control
    /// plane, and rebuilds the `module → source` index from the listing.
    fn purge_orphan_symlinks(&self) -> Result<(), ReconcileError> {
        let mut orphans = self.read_module_links()?;
        let releases = self.releases.list_all()?;
        debug!(count = releases.len(), "module releases found");

        for release in &releases {
            self.index_module_source(&release.spec.module_name, &release.spec.module_source);
            orphans.remove(&release.spec.module_name);
        }

        for (module, symlink) in orphans {
            warn!(%module, "module has no releases, purging from the filesystem");
            if let Err(err) = self.materializer.disable(&symlink) {
                warn!(%module, %err, "purging the orphan symlink failed");
            }
        }
        Ok(())
    }

    /// Map of `module name → symlink path` parsed from the symlinks
    /// directory; entries without a weight prefix are skipped.
    fn read_module_links(&self) -> Result<HashMap<String, PathBuf>, ReconcileError> {
        let entries = match fs::read_dir(self.materializer.symlinks_dir()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => {
                return Err(MaterializeError::io("reading the symlinks directory", err).into())
            }
        };

        let mut links = HashMap::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| MaterializeError::io("reading the symlinks directory", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some((_, module)) = name.split_once('-') {
                links.insert(module.to_string(), entry.path());
            }
        }
        Ok(links)
    }
}
