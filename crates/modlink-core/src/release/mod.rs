//! Module release records and their lifecycle phases.
//!
//! A [`ModuleRelease`] is the control-plane record for one concrete version of
//! a module published by a [`ModuleSource`]. Releases move through the phases
//! of [`Phase`]; the reconciler owns two finalizer tokens that gate deletion:
//! [`FS_RELEASE_FINALIZER`] on a release while its payload is on disk, and
//! [`SOURCE_RELEASE_FINALIZER`] on a source while one of its releases is
//! deployed.

pub mod predictor;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Finalizer kept on a release while its payload exists on the filesystem.
pub const FS_RELEASE_FINALIZER: &str = "modlink.io/exists-on-fs";

/// Finalizer kept on a source while at least one of its releases is deployed.
pub const SOURCE_RELEASE_FINALIZER: &str = "modlink.io/release-exists";

/// Label key carrying the module name a release belongs to.
pub const MODULE_LABEL: &str = "module";

/// Label key mirroring the lowercased phase for external selection.
pub const STATUS_LABEL: &str = "status";

/// Error returned when parsing a phase from its string form.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown release phase {value:?}")]
pub struct PhaseParseError {
    /// The string that failed to parse.
    pub value: String,
}

/// Lifecycle phase of a module release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Observed but not yet selected for deployment.
    Pending,
    /// The enabled version of its module.
    Deployed,
    /// Overtaken by a newer version, or bypassed by the predictor.
    Superseded,
    /// Deployment failed; left alone until the next event for the release.
    Suspended,
}

impl Phase {
    /// Returns the canonical string form of this phase.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Deployed => "Deployed",
            Self::Superseded => "Superseded",
            Self::Suspended => "Suspended",
        }
    }

    /// Returns the lowercased form used as the `status` label value.
    #[must_use]
    pub const fn status_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Deployed => "deployed",
            Self::Superseded => "superseded",
            Self::Suspended => "suspended",
        }
    }

    /// Parses a phase from its canonical string form.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseParseError`] if the string is not a known phase.
    pub fn parse(s: &str) -> Result<Self, PhaseParseError> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Deployed" => Ok(Self::Deployed),
            "Superseded" => Ok(Self::Superseded),
            "Suspended" => Ok(Self::Suspended),
            _ => Err(PhaseParseError {
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common record metadata: identity, optimistic-concurrency version, labels,
/// finalizers, and the two-phase deletion marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Record name, unique per kind.
    pub name: String,

    /// Monotonic version assigned by the store on every write.
    #[serde(default)]
    pub resource_version: u64,

    /// Free-form labels; `module` and `status` are maintained here.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Finalizer tokens blocking deletion until their owners remove them.
    #[serde(default)]
    pub finalizers: Vec<String>,

    /// Set when the control plane wants the record gone.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Whether the given finalizer token is present.
    #[must_use]
    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.iter().any(|f| f == token)
    }

    /// Adds a finalizer token. Returns `true` if the record changed.
    pub fn add_finalizer(&mut self, token: &str) -> bool {
        if self.has_finalizer(token) {
            return false;
        }
        self.finalizers.push(token.to_string());
        true
    }

    /// Removes a finalizer token. Returns `true` if the record changed.
    pub fn remove_finalizer(&mut self, token: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != token);
        self.finalizers.len() != before
    }

    /// Sets a label. Returns `true` if the record changed.
    pub fn set_label(&mut self, key: &str, value: &str) -> bool {
        if self.labels.get(key).is_some_and(|v| v == value) {
            return false;
        }
        self.labels.insert(key.to_string(), value.to_string());
        true
    }
}

/// Desired state of a module release: which module, version, and source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleReleaseSpec {
    /// Identifier of the module this release belongs to.
    pub module_name: String,

    /// Version of the module payload.
    pub version: Version,

    /// Enable-order prefix of the on-disk symlink.
    #[serde(default)]
    pub weight: u32,

    /// Identifier of the source catalog that produced the release.
    pub module_source: String,
}

/// Observed state of a module release.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleReleaseStatus {
    /// Current lifecycle phase; absent until first observation.
    #[serde(default)]
    pub phase: Option<Phase>,

    /// Human-readable diagnostic, populated for suspended releases.
    #[serde(default)]
    pub message: String,

    /// Timestamp of the last phase write.
    #[serde(default)]
    pub transition_time: Option<DateTime<Utc>>,
}

/// One concrete version of a module, the unit of reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRelease {
    /// Record metadata.
    pub meta: ObjectMeta,
    /// Desired state.
    pub spec: ModuleReleaseSpec,
    /// Observed state.
    #[serde(default)]
    pub status: ModuleReleaseStatus,
}

impl ModuleRelease {
    /// Creates a release record carrying the `module` membership label.
    #[must_use]
    pub fn new(name: impl Into<String>, spec: ModuleReleaseSpec) -> Self {
        let mut meta = ObjectMeta {
            name: name.into(),
            ..ObjectMeta::default()
        };
        meta.set_label(MODULE_LABEL, &spec.module_name);
        Self {
            meta,
            spec,
            status: ModuleReleaseStatus::default(),
        }
    }

    /// Record name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    /// Current phase, if any.
    #[must_use]
    pub fn phase(&self) -> Option<Phase> {
        self.status.phase
    }

    /// Whether the control plane has requested deletion.
    #[must_use]
    pub fn is_deleting(&self) -> bool {
        self.meta.deletion_timestamp.is_some()
    }

    /// Writes a phase, stamping the transition time.
    pub fn set_phase(&mut self, phase: Phase) {
        self.status.phase = Some(phase);
        self.status.transition_time = Some(Utc::now());
    }

    /// First observation: the release enters the selection process.
    pub fn mark_pending(&mut self) {
        self.set_phase(Phase::Pending);
    }

    /// The release became the enabled version of its module.
    pub fn mark_deployed(&mut self) {
        self.set_phase(Phase::Deployed);
        self.status.message.clear();
    }

    /// The release was overtaken or bypassed.
    pub fn mark_superseded(&mut self) {
        self.set_phase(Phase::Superseded);
        self.status.message.clear();
    }

    /// Deployment failed; record the diagnostic.
    pub fn mark_suspended(&mut self, message: &str) {
        self.set_phase(Phase::Suspended);
        self.status.message = message.to_string();
    }
}

/// A named catalog of modules. The reconciler only ever stamps or observes
/// the `release-exists` finalizer on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSource {
    /// Record metadata.
    pub meta: ObjectMeta,
}

impl ModuleSource {
    /// Creates a source record.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta {
                name: name.into(),
                ..ObjectMeta::default()
            },
        }
    }

    /// Record name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.meta.name
    }
}

/// Sorts releases ascending by version, the order the predictor expects.
pub fn sort_by_version(releases: &mut [ModuleRelease]) {
    releases.sort_by(|a, b| a.spec.version.cmp(&b.spec.version));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn release(version: &str) -> ModuleRelease {
        ModuleRelease::new(
            format!("mod-a-{version}"),
            ModuleReleaseSpec {
                module_name: "mod-a".to_string(),
                version: Version::parse(version).expect("test version"),
                weight: 10,
                module_source: "main".to_string(),
            },
        )
    }

    #[test]
    fn new_release_carries_module_label() {
        let release = release("1.0.0");
        assert_eq!(
            release.meta.labels.get(MODULE_LABEL).map(String::as_str),
            Some("mod-a")
        );
    }

    #[test]
    fn finalizer_add_remove_reports_changes() {
        let mut meta = ObjectMeta::default();
        assert!(meta.add_finalizer(FS_RELEASE_FINALIZER));
        assert!(!meta.add_finalizer(FS_RELEASE_FINALIZER));
        assert!(meta.has_finalizer(FS_RELEASE_FINALIZER));
        assert!(meta.remove_finalizer(FS_RELEASE_FINALIZER));
        assert!(!meta.remove_finalizer(FS_RELEASE_FINALIZER));
    }

    #[test]
    fn set_label_is_idempotent() {
        let mut meta = ObjectMeta::default();
        assert!(meta.set_label(STATUS_LABEL, "deployed"));
        assert!(!meta.set_label(STATUS_LABEL, "deployed"));
        assert!(meta.set_label(STATUS_LABEL, "superseded"));
    }

    #[test]
    fn suspended_message_is_cleared_on_promotion() {
        let mut release = release("1.0.0");
        release.mark_suspended("payload missing");
        assert_eq!(release.phase(), Some(Phase::Suspended));
        assert!(!release.status.message.is_empty());

        release.mark_deployed();
        assert_eq!(release.phase(), Some(Phase::Deployed));
        assert!(release.status.message.is_empty());
        assert!(release.status.transition_time.is_some());
    }

    #[test]
    fn sort_orders_by_semver_not_lexicographically() {
        let mut releases = vec![release("1.10.0"), release("1.2.0"), release("1.9.1")];
        sort_by_version(&mut releases);
        let versions: Vec<String> = releases
            .iter()
            .map(|r| r.spec.version.to_string())
            .collect();
        assert_eq!(versions, vec!["1.2.0", "1.9.1", "1.10.0"]);
    }

    #[test]
    fn phase_round_trips_through_strings() {
        for phase in [
            Phase::Pending,
            Phase::Deployed,
            Phase::Superseded,
            Phase::Suspended,
        ] {
            assert_eq!(Phase::parse(phase.as_str()), Ok(phase));
        }
        assert!(Phase::parse("Unknown").is_err());
    }
}
