//! Seams between the reconciler and its host process.
//!
//! The reconciler is embedded in a larger supervised process: it signals the
//! host to reload, asks a registry downloader to fetch payloads, and notifies
//! the host configuration service about module/source pairings. Each of these
//! collaborators is consumed through a trait so the daemon can be wired
//! against production implementations or test doubles.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use modlink_core::release::ModuleSource;

/// Errors from the payload downloader.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DownloadError {
    /// The registry fetch failed.
    #[error("fetching {module}:{version} failed: {reason}")]
    Fetch {
        /// Module name.
        module: String,
        /// Requested version, `v`-prefixed.
        version: String,
        /// Registry-reported reason.
        reason: String,
    },

    /// An I/O error occurred while writing the payload.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Sends the process-level restart signal to the host.
pub trait RestartSignaler: Send + Sync {
    /// Raises the restart signal.
    ///
    /// # Errors
    ///
    /// Returns an error when the signal cannot be delivered; callers treat
    /// this as fatal.
    fn signal_restart(&self) -> io::Result<()>;
}

/// Production signaler: SIGUSR2 to PID 1.
///
/// This is a container-specific contract: the reconciler runs as a child of
/// the supervisor occupying PID 1, and the supervisor reloads its module set
/// on SIGUSR2. Deployments with a different process layout must supply their
/// own [`RestartSignaler`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProcessSignaler;

impl RestartSignaler for HostProcessSignaler {
    fn signal_restart(&self) -> io::Result<()> {
        signal::kill(Pid::from_raw(1), Signal::SIGUSR2)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
    }
}

/// Fetches module payloads from a source catalog into the modules root.
pub trait ModuleDownloader {
    /// Downloads `<module>` at `<version>` (`v`-prefixed) into
    /// `<root>/<module>/<version>/`.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the payload cannot be fetched.
    fn download(&self, module: &str, version: &str) -> Result<(), DownloadError>;
}

/// Builds downloaders bound to a source's registry credentials.
pub trait DownloaderFactory: Send + Sync {
    /// Creates a downloader writing below `root` with the registry options of
    /// `source`.
    fn for_source(&self, root: &Path, source: &ModuleSource) -> Box<dyn ModuleDownloader>;
}

/// Factory used when no registry integration is wired; every download fails
/// and preflight logs the release as skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDownloader;

struct NoDownloaderInstance;

impl ModuleDownloader for NoDownloaderInstance {
    fn download(&self, module: &str, version: &str) -> Result<(), DownloadError> {
        Err(DownloadError::Fetch {
            module: module.to_string(),
            version: version.to_string(),
            reason: "no registry downloader is configured".to_string(),
        })
    }
}

impl DownloaderFactory for NoDownloader {
    fn for_source(&self, _root: &Path, _source: &ModuleSource) -> Box<dyn ModuleDownloader> {
        Box::new(NoDownloaderInstance)
    }
}

/// Host configuration service: records which source currently provides a
/// module. Idempotent by contract.
pub trait ConfigService: Send + Sync {
    /// Associates `module` with `source`.
    fn add_module_name_to_source(&self, module: &str, source: &str);
}

/// In-memory recording implementation of [`ConfigService`].
#[derive(Debug, Default)]
pub struct MemoryConfigService {
    assignments: RwLock<HashMap<String, String>>,
}

impl MemoryConfigService {
    /// Snapshot of the recorded module/source pairings.
    #[must_use]
    pub fn assignments(&self) -> HashMap<String, String> {
        self.assignments.read().clone()
    }
}

impl ConfigService for MemoryConfigService {
    fn add_module_name_to_source(&self, module: &str, source: &str) {
        self.assignments
            .write()
            .insert(module.to_string(), source.to_string());
    }
}

/// Seam for the documentation publisher invoked on each new deployment.
pub trait DocumentationPublisher: Send + Sync {
    /// Publishes documentation for the payload at `module_path`.
    fn publish(&self, module_path: &Path);
}

/// Stub publisher: the documentation protocol is not finalized, so releases
/// deploy without documentation side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDocumentationPublisher;

impl DocumentationPublisher for NoopDocumentationPublisher {
    fn publish(&self, module_path: &Path) {
        debug!(
            path = %module_path.display(),
            "documentation publishing is not implemented, skipping"
        );
    }
}
