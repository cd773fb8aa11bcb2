//! Control-plane access contracts consumed by the reconciler.
//!
//! The reconciler reads releases through a lister-like cache and writes them
//! back through a typed client; both roles are folded into [`ReleaseStore`]
//! here because every implementation in this repository is cache-backed.
//! Change events stream to subscribers as [`ReleaseEvent`] values.

mod memory;

pub use memory::MemoryCluster;

use std::io;

use thiserror::Error;

use crate::release::{ModuleRelease, ModuleSource};

/// Errors surfaced by control-plane operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The requested record does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Record kind.
        kind: &'static str,
        /// Record name.
        name: String,
    },

    /// A write carried a stale resource version.
    #[error("conflicting write to {kind} {name:?}: resource version {stale} is stale (current {current})")]
    Conflict {
        /// Record kind.
        kind: &'static str,
        /// Record name.
        name: String,
        /// Resource version carried by the write.
        stale: u64,
        /// Resource version currently stored.
        current: u64,
    },

    /// An I/O error from a persistent backend.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A record could not be serialized or deserialized.
    #[error("serialization error for {context}: {source}")]
    Serialize {
        /// Description of the record involved.
        context: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },
}

impl ClusterError {
    /// Convenience constructor for I/O errors with context.
    #[must_use]
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether this error means the record does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Read and write access to module release records.
pub trait ReleaseStore: Send + Sync {
    /// Fetches a release by name.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] when the release does not exist.
    fn get(&self, name: &str) -> Result<ModuleRelease, ClusterError>;

    /// Lists releases carrying the given label.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store cannot be read.
    fn list_labelled(&self, key: &str, value: &str) -> Result<Vec<ModuleRelease>, ClusterError>;

    /// Lists every release.
    ///
    /// # Errors
    ///
    /// Returns an error when the backing store cannot be read.
    fn list_all(&self) -> Result<Vec<ModuleRelease>, ClusterError>;

    /// Writes metadata and spec, leaving status untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Conflict`] when the write carries a stale
    /// resource version, [`ClusterError::NotFound`] when the record is gone.
    fn update(&self, release: &ModuleRelease) -> Result<ModuleRelease, ClusterError>;

    /// Writes status, leaving metadata and spec untouched.
    ///
    /// # Errors
    ///
    /// Same contract as [`ReleaseStore::update`].
    fn update_status(&self, release: &ModuleRelease) -> Result<ModuleRelease, ClusterError>;
}

/// Read and write access to module source records.
pub trait SourceStore: Send + Sync {
    /// Fetches a source by name.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] when the source does not exist.
    fn get_source(&self, name: &str) -> Result<ModuleSource, ClusterError>;

    /// Writes a source record.
    ///
    /// # Errors
    ///
    /// Same contract as [`ReleaseStore::update`].
    fn update_source(&self, source: &ModuleSource) -> Result<ModuleSource, ClusterError>;
}

/// A change observed in the release cache.
#[derive(Debug, Clone)]
pub enum ReleaseEvent {
    /// A release appeared.
    Added(ModuleRelease),
    /// A release changed; periodic resync replays unchanged records with
    /// identical resource versions.
    Updated {
        /// The previously cached record.
        old: ModuleRelease,
        /// The new record.
        new: ModuleRelease,
    },
    /// A release disappeared.
    Deleted(ModuleRelease),
}

impl ReleaseEvent {
    /// Name of the release the event refers to.
    #[must_use]
    pub fn release_name(&self) -> &str {
        match self {
            Self::Added(release) | Self::Deleted(release) => release.name(),
            Self::Updated { new, .. } => new.name(),
        }
    }
}

/// Callback receiving cache events.
pub type EventSubscriber = Box<dyn Fn(&ReleaseEvent) + Send + Sync>;
