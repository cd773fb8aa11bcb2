//! Manifest-directory control plane backend.
//!
//! Release and source records live as JSON manifests under
//! `<dir>/releases/` and `<dir>/sources/`, one file per record named after
//! it. The directory is loaded into an in-memory cluster at boot and
//! re-scanned on an interval, so operator edits surface as ordinary cache
//! events: a new file becomes a create, a spec edit becomes an update, and a
//! removed file starts the two-phase deletion. Status and finalizer writes
//! are persisted back with a write-temp-then-rename protocol so a crash
//! leaves either the old or the new manifest, never a torn one.
//!
//! Resource versions are assigned by the in-memory store and never read back
//! from disk.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

use modlink_core::cluster::{
    ClusterError, EventSubscriber, MemoryCluster, ReleaseStore, SourceStore,
};
use modlink_core::release::{ModuleRelease, ModuleSource, MODULE_LABEL};

/// Subdirectory holding release manifests.
pub const RELEASES_SUBDIR: &str = "releases";

/// Subdirectory holding source manifests.
pub const SOURCES_SUBDIR: &str = "sources";

/// Maximum manifest size accepted from disk.
const MAX_MANIFEST_SIZE: u64 = 1024 * 1024;

/// A control plane backed by a directory of JSON manifests.
pub struct StateDirCluster {
    dir: PathBuf,
    memory: MemoryCluster,
}

impl StateDirCluster {
    /// Opens a state directory, creating its layout when absent, and loads
    /// every manifest into memory.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Io`] when the layout cannot be created or a
    /// directory cannot be read. Unreadable individual manifests are logged
    /// and skipped.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Arc<Self>, ClusterError> {
        let dir = dir.into();
        for subdir in [RELEASES_SUBDIR, SOURCES_SUBDIR] {
            fs::create_dir_all(dir.join(subdir))
                .map_err(|e| ClusterError::io("creating the state directory layout", e))?;
        }
        let cluster = Arc::new(Self {
            dir,
            memory: MemoryCluster::new(),
        });
        cluster.load()?;
        Ok(cluster)
    }

    /// Registers a subscriber for release cache events.
    pub fn subscribe(&self, subscriber: EventSubscriber) {
        self.memory.subscribe(subscriber);
    }

    fn releases_dir(&self) -> PathBuf {
        self.dir.join(RELEASES_SUBDIR)
    }

    fn sources_dir(&self) -> PathBuf {
        self.dir.join(SOURCES_SUBDIR)
    }

    fn release_path(&self, name: &str) -> PathBuf {
        self.releases_dir().join(format!("{name}.json"))
    }

    fn source_path(&self, name: &str) -> PathBuf {
        self.sources_dir().join(format!("{name}.json"))
    }

    fn load(&self) -> Result<(), ClusterError> {
        for source in read_manifests::<ModuleSource>(&self.sources_dir())? {
            self.memory.create_source(source);
        }
        for mut release in read_manifests::<ModuleRelease>(&self.releases_dir())? {
            let module = release.spec.module_name.clone();
            release.meta.set_label(MODULE_LABEL, &module);
            self.memory.create_release(release);
        }
        Ok(())
    }

    /// Re-scans the directory, surfacing operator edits as cache events.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when a directory cannot be read or a
    /// surfaced edit cannot be applied.
    pub fn poll(&self) -> Result<(), ClusterError> {
        for source in read_manifests::<ModuleSource>(&self.sources_dir())? {
            if self
                .memory
                .get_source(source.name())
                .is_err_and(|err| err.is_not_found())
            {
                debug!(source = source.name(), "new module source manifest");
                self.memory.create_source(source);
            }
        }

        let mut seen = HashSet::new();
        for manifest in read_manifests::<ModuleRelease>(&self.releases_dir())? {
            seen.insert(manifest.meta.name.clone());
            match self.memory.get(&manifest.meta.name) {
                Err(err) if err.is_not_found() => {
                    debug!(release = %manifest.meta.name, "new module release manifest");
                    let mut fresh = manifest;
                    let module = fresh.spec.module_name.clone();
                    fresh.meta.set_label(MODULE_LABEL, &module);
                    self.memory.create_release(fresh);
                }
                Ok(existing) => {
                    if existing.is_deleting() || existing.spec == manifest.spec {
                        continue;
                    }
                    debug!(release = existing.name(), "module release spec changed");
                    let mut updated = existing;
                    updated.spec = manifest.spec;
                    self.update(&updated)?;
                }
                Err(err) => return Err(err),
            }
        }

        for release in self.memory.list_all()? {
            if !seen.contains(release.name()) && !release.is_deleting() {
                debug!(release = release.name(), "module release manifest removed");
                self.memory.mark_for_deletion(release.name())?;
            }
        }
        Ok(())
    }

    /// Runs the poll loop until `shutdown` flips to true.
    pub async fn run_poller(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; the directory was just loaded.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => {
                    debug!("state directory poller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.poll() {
                        warn!(%err, "state directory poll failed");
                    }
                }
            }
        }
    }

    fn persist_release(&self, release: &ModuleRelease) -> Result<(), ClusterError> {
        let path = self.release_path(release.name());
        if release.is_deleting() && release.meta.finalizers.is_empty() {
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ClusterError::io("removing a release manifest", e)),
            }
        } else {
            write_manifest(&path, release)
        }
    }
}

impl ReleaseStore for StateDirCluster {
    fn get(&self, name: &str) -> Result<ModuleRelease, ClusterError> {
        self.memory.get(name)
    }

    fn list_labelled(&self, key: &str, value: &str) -> Result<Vec<ModuleRelease>, ClusterError> {
        self.memory.list_labelled(key, value)
    }

    fn list_all(&self) -> Result<Vec<ModuleRelease>, ClusterError> {
        self.memory.list_all()
    }

    fn update(&self, release: &ModuleRelease) -> Result<ModuleRelease, ClusterError> {
        let updated = self.memory.update(release)?;
        self.persist_release(&updated)?;
        Ok(updated)
    }

    fn update_status(&self, release: &ModuleRelease) -> Result<ModuleRelease, ClusterError> {
        let updated = self.memory.update_status(release)?;
        self.persist_release(&updated)?;
        Ok(updated)
    }
}

impl SourceStore for StateDirCluster {
    fn get_source(&self, name: &str) -> Result<ModuleSource, ClusterError> {
        self.memory.get_source(name)
    }

    fn update_source(&self, source: &ModuleSource) -> Result<ModuleSource, ClusterError> {
        let updated = self.memory.update_source(source)?;
        write_manifest(&self.source_path(updated.name()), &updated)?;
        Ok(updated)
    }
}

fn read_manifests<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, ClusterError> {
    let entries = fs::read_dir(dir)
        .map_err(|e| ClusterError::io("reading the manifest directory", e))?;

    let mut records = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ClusterError::io("reading the manifest directory", e))?;
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        match read_manifest(&path) {
            Ok(record) => records.push(record),
            Err(err) => warn!(path = %path.display(), %err, "skipping an unreadable manifest"),
        }
    }
    Ok(records)
}

fn read_manifest<T: DeserializeOwned>(path: &Path) -> Result<T, ClusterError> {
    let metadata =
        fs::metadata(path).map_err(|e| ClusterError::io("reading a manifest", e))?;
    if metadata.len() > MAX_MANIFEST_SIZE {
        return Err(ClusterError::io(
            "reading a manifest",
            io::Error::new(io::ErrorKind::InvalidData, "manifest exceeds the size limit"),
        ));
    }
    let data = fs::read(path).map_err(|e| ClusterError::io("reading a manifest", e))?;
    serde_json::from_slice(&data).map_err(|e| ClusterError::Serialize {
        context: path.display().to_string(),
        source: e,
    })
}

/// Writes a manifest through a temp file in the same directory, fsyncs the
/// data, then renames into place.
fn write_manifest<T: Serialize>(path: &Path, record: &T) -> Result<(), ClusterError> {
    let data = serde_json::to_vec_pretty(record).map_err(|e| ClusterError::Serialize {
        context: path.display().to_string(),
        source: e,
    })?;

    let tmp = path.with_extension("json.tmp");
    let mut file =
        File::create(&tmp).map_err(|e| ClusterError::io("creating a manifest temp file", e))?;
    file.write_all(&data)
        .map_err(|e| ClusterError::io("writing a manifest temp file", e))?;
    file.sync_all()
        .map_err(|e| ClusterError::io("syncing a manifest temp file", e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| ClusterError::io("renaming a manifest into place", e))
}
