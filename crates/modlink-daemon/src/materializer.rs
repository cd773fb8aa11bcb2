//! Filesystem materialization of module releases.
//!
//! The on-disk contract rooted at the external modules directory:
//!
//! - `<root>/<module>/v<version>/…` holds a release's payload.
//! - `<root>/modules/<weight>-<module>` is a **relative** symlink to
//!   `../<module>/v<version>`; at most one exists per module, and its
//!   presence is what enables the module in the host.
//!
//! Targets stay relative so the whole tree can be moved or remounted without
//! invalidating links.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::debug;

/// Subdirectory of the modules root holding the enable symlinks.
pub const SYMLINKS_SUBDIR: &str = "modules";

/// Weight assumed when no existing symlink can be located for a module, so
/// that enabling still writes to a deterministic location.
pub const FALLBACK_WEIGHT: u32 = 900;

/// Errors from filesystem materialization.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MaterializeError {
    /// The payload directory for the requested version is absent.
    #[error("module payload missing at {}", path.display())]
    PayloadMissing {
        /// Expected payload directory.
        path: PathBuf,
    },

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Description of the operation that failed.
        context: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

impl MaterializeError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Whether the error reports an absent payload directory.
    #[must_use]
    pub const fn is_payload_missing(&self) -> bool {
        matches!(self, Self::PayloadMissing { .. })
    }
}

/// Creates and removes payload directories and enable symlinks.
#[derive(Debug, Clone)]
pub struct Materializer {
    root: PathBuf,
    symlinks_dir: PathBuf,
}

impl Materializer {
    /// Creates a materializer rooted at the external modules directory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let symlinks_dir = root.join(SYMLINKS_SUBDIR);
        Self { root, symlinks_dir }
    }

    /// The external modules directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding enable symlinks.
    #[must_use]
    pub fn symlinks_dir(&self) -> &Path {
        &self.symlinks_dir
    }

    /// Creates the root and symlinks directories if absent.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError::Io`] when the directories cannot be
    /// created.
    pub fn ensure_layout(&self) -> Result<(), MaterializeError> {
        fs::create_dir_all(&self.symlinks_dir)
            .map_err(|e| MaterializeError::io("creating symlinks directory", e))
    }

    /// Relative target written into enable symlinks: `../<module>/v<version>`.
    #[must_use]
    pub fn relative_payload_path(module: &str, version: &str) -> PathBuf {
        PathBuf::from("..").join(module).join(format!("v{version}"))
    }

    /// Absolute payload directory for a module version.
    #[must_use]
    pub fn payload_dir(&self, module: &str, version: &str) -> PathBuf {
        self.root.join(module).join(format!("v{version}"))
    }

    /// Enable symlink path for a module under the given weight.
    #[must_use]
    pub fn symlink_path(&self, weight: u32, module: &str) -> PathBuf {
        self.symlinks_dir.join(format!("{weight}-{module}"))
    }

    /// Resolves a relative enable target to its absolute payload directory.
    fn absolute_target(&self, relative_target: &Path) -> PathBuf {
        let stripped = relative_target
            .strip_prefix("..")
            .unwrap_or(relative_target);
        self.root.join(stripped)
    }

    /// Switches a module's enabled version.
    ///
    /// Removes `current_symlink` when present, removes a leftover
    /// `new_symlink` when present, then creates `new_symlink` as a relative
    /// symbolic link with the textual target `relative_target`. The three
    /// steps are not atomic; a crash in between leaves the module disabled
    /// until the next reconcile pass restores it.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError::PayloadMissing`] when the payload
    /// directory for `relative_target` does not exist, and
    /// [`MaterializeError::Io`] for any filesystem failure.
    pub fn enable(
        &self,
        current_symlink: Option<&Path>,
        new_symlink: &Path,
        relative_target: &Path,
    ) -> Result<(), MaterializeError> {
        let payload = self.absolute_target(relative_target);
        if !payload.is_dir() {
            return Err(MaterializeError::PayloadMissing { path: payload });
        }

        if let Some(current) = current_symlink {
            if fs::symlink_metadata(current).is_ok() {
                remove_path(current)
                    .map_err(|e| MaterializeError::io("removing previous symlink", e))?;
            }
        }
        if fs::symlink_metadata(new_symlink).is_ok() {
            remove_path(new_symlink)
                .map_err(|e| MaterializeError::io("removing stale symlink", e))?;
        }

        std::os::unix::fs::symlink(relative_target, new_symlink)
            .map_err(|e| MaterializeError::io("creating module symlink", e))?;
        debug!(
            symlink = %new_symlink.display(),
            target = %relative_target.display(),
            "module symlink enabled"
        );
        Ok(())
    }

    /// Removes an enable symlink; an already-absent link is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError::Io`] when removal fails for any reason
    /// other than the link being absent.
    pub fn disable(&self, symlink: &Path) -> Result<(), MaterializeError> {
        match remove_path(symlink) {
            Ok(()) => {
                debug!(symlink = %symlink.display(), "module symlink removed");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MaterializeError::io("removing module symlink", e)),
        }
    }

    /// Recursively removes the payload directory of a module version; an
    /// already-absent directory is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializeError::Io`] on filesystem failures.
    pub fn purge_payload(&self, module: &str, version: &str) -> Result<(), MaterializeError> {
        let dir = self.payload_dir(module, version);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(path = %dir.display(), "module payload purged");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MaterializeError::io("purging module payload", e)),
        }
    }

    /// Locates the enable symlink for a module regardless of its weight
    /// prefix. The weight of a new version may differ from the old one, so
    /// the lookup matches `<anything-numeric>-<module>` as well as a bare
    /// `<module>` entry.
    #[must_use]
    pub fn find_current_symlink(&self, module: &str) -> Option<PathBuf> {
        let pattern = Regex::new(&format!(r"^(([0-9]+)-)?{}$", regex::escape(module)))
            .expect("module symlink pattern is valid");

        let mut entries: Vec<_> = fs::read_dir(&self.symlinks_dir).ok()?.flatten().collect();
        entries.sort_by_key(std::fs::DirEntry::file_name);
        entries
            .iter()
            .find(|entry| pattern.is_match(&entry.file_name().to_string_lossy()))
            .map(|entry| entry.path())
    }

    /// The enable symlink for a module, falling back to the synthetic
    /// `900-<module>` location when none exists yet.
    #[must_use]
    pub fn current_or_fallback(&self, module: &str) -> PathBuf {
        self.find_current_symlink(module)
            .unwrap_or_else(|| self.symlink_path(FALLBACK_WEIGHT, module))
    }

    /// Whether `symlink` resolves to the expected relative payload target.
    ///
    /// The resolved path is re-expressed relative to the symlinks directory
    /// before the textual comparison, so absolute resolution does not defeat
    /// the relative-target contract.
    #[must_use]
    pub fn is_payload_linked(&self, symlink: &Path, expected_target: &Path) -> bool {
        let Ok(resolved) = fs::canonicalize(symlink) else {
            return false;
        };
        let relative = if resolved.is_absolute() {
            let Ok(base) = fs::canonicalize(&self.symlinks_dir) else {
                return false;
            };
            relative_path(&base, &resolved)
        } else {
            resolved
        };
        relative == expected_target
    }
}

/// Removes a path that may be a symlink, file, or directory.
fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Expresses `target` relative to `base`; both must be absolute.
fn relative_path(base: &Path, target: &Path) -> PathBuf {
    let base_components: Vec<_> = base.components().collect();
    let target_components: Vec<_> = target.components().collect();
    let common = base_components
        .iter()
        .zip(&target_components)
        .take_while(|(a, b)| a == b)
        .count();

    let mut relative = PathBuf::new();
    for _ in common..base_components.len() {
        relative.push("..");
    }
    for component in &target_components[common..] {
        relative.push(component);
    }
    relative
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn materializer() -> (TempDir, Materializer) {
        let root = TempDir::new().expect("temp root");
        let materializer = Materializer::new(root.path());
        materializer.ensure_layout().expect("layout");
        (root, materializer)
    }

    fn seed_payload(materializer: &Materializer, module: &str, version: &str) {
        fs::create_dir_all(materializer.payload_dir(module, version)).expect("payload dir");
    }

    #[test]
    fn enable_creates_a_relative_symlink() {
        let (_root, materializer) = materializer();
        seed_payload(&materializer, "mod-a", "1.0.0");

        let link = materializer.symlink_path(10, "mod-a");
        let target = Materializer::relative_payload_path("mod-a", "1.0.0");
        materializer.enable(None, &link, &target).expect("enable");

        assert_eq!(fs::read_link(&link).expect("read link"), target);
        assert!(materializer.is_payload_linked(&link, &target));
    }

    #[test]
    fn enable_fails_without_a_payload() {
        let (_root, materializer) = materializer();
        let link = materializer.symlink_path(10, "mod-a");
        let target = Materializer::relative_payload_path("mod-a", "1.0.0");

        let err = materializer
            .enable(None, &link, &target)
            .expect_err("payload is absent");
        assert!(err.is_payload_missing());
        assert!(fs::symlink_metadata(&link).is_err());
    }

    #[test]
    fn enable_replaces_a_symlink_under_a_different_weight() {
        let (_root, materializer) = materializer();
        seed_payload(&materializer, "mod-a", "1.0.0");
        seed_payload(&materializer, "mod-a", "1.1.0");

        let old_link = materializer.symlink_path(10, "mod-a");
        materializer
            .enable(
                None,
                &old_link,
                &Materializer::relative_payload_path("mod-a", "1.0.0"),
            )
            .expect("first enable");

        let new_link = materializer.symlink_path(20, "mod-a");
        let new_target = Materializer::relative_payload_path("mod-a", "1.1.0");
        materializer
            .enable(Some(&old_link), &new_link, &new_target)
            .expect("second enable");

        assert!(fs::symlink_metadata(&old_link).is_err());
        assert_eq!(fs::read_link(&new_link).expect("read link"), new_target);
    }

    #[test]
    fn find_current_symlink_ignores_other_modules() {
        let (_root, materializer) = materializer();
        seed_payload(&materializer, "mod-a", "1.0.0");
        seed_payload(&materializer, "mod-ab", "1.0.0");

        materializer
            .enable(
                None,
                &materializer.symlink_path(10, "mod-a"),
                &Materializer::relative_payload_path("mod-a", "1.0.0"),
            )
            .expect("enable mod-a");
        materializer
            .enable(
                None,
                &materializer.symlink_path(20, "mod-ab"),
                &Materializer::relative_payload_path("mod-ab", "1.0.0"),
            )
            .expect("enable mod-ab");

        let found = materializer.find_current_symlink("mod-a").expect("found");
        assert_eq!(found, materializer.symlink_path(10, "mod-a"));
        assert!(materializer.find_current_symlink("mod-c").is_none());
    }

    #[test]
    fn current_or_fallback_uses_the_synthetic_weight() {
        let (_root, materializer) = materializer();
        assert_eq!(
            materializer.current_or_fallback("mod-a"),
            materializer.symlink_path(FALLBACK_WEIGHT, "mod-a")
        );
    }

    #[test]
    fn is_payload_linked_rejects_broken_and_mismatched_links() {
        let (_root, materializer) = materializer();
        seed_payload(&materializer, "mod-a", "1.0.0");

        let link = materializer.symlink_path(10, "mod-a");
        let target = Materializer::relative_payload_path("mod-a", "1.0.0");
        materializer.enable(None, &link, &target).expect("enable");

        let other = Materializer::relative_payload_path("mod-a", "1.1.0");
        assert!(!materializer.is_payload_linked(&link, &other));

        fs::remove_dir_all(materializer.payload_dir("mod-a", "1.0.0")).expect("break link");
        assert!(!materializer.is_payload_linked(&link, &target));
    }

    #[test]
    fn purge_payload_is_idempotent() {
        let (_root, materializer) = materializer();
        seed_payload(&materializer, "mod-a", "1.0.0");

        materializer.purge_payload("mod-a", "1.0.0").expect("purge");
        assert!(!materializer.payload_dir("mod-a", "1.0.0").exists());
        materializer
            .purge_payload("mod-a", "1.0.0")
            .expect("second purge");
    }
}
