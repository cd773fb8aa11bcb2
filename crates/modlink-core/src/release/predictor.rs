//! Release selection: choosing which release of a module should be enabled.
//!
//! The predictor looks at all releases of one module, sorted ascending by
//! version, and nominates the release to deploy next. Promotion can be gated
//! externally (update windows, manual approval) through the [`PromotePolicy`]
//! hook; the default policy always promotes the newest pending release.

use super::{ModuleRelease, Phase};

/// Gate deciding whether a pending release may be promoted in this pass.
pub trait PromotePolicy {
    /// Whether the release is allowed to become the deployed version now.
    fn may_promote(&self, release: &ModuleRelease) -> bool;
}

/// Default policy: every pending release may be promoted.
#[derive(Debug, Clone, Copy, Default)]
pub struct PromoteAlways;

impl PromotePolicy for PromoteAlways {
    fn may_promote(&self, _release: &ModuleRelease) -> bool {
        true
    }
}

/// Outcome of one prediction pass over a module's releases.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleasePrediction {
    /// Index of the presently deployed release.
    pub current_index: Option<usize>,

    /// Index of the release that should become deployed in this pass.
    pub desired_index: Option<usize>,

    /// Indices of pending releases bypassed on the way to the desired one;
    /// they must be marked superseded.
    pub skipped_patches: Vec<usize>,
}

impl ReleasePrediction {
    /// Whether the deployed release is already the newest known version.
    #[must_use]
    pub fn current_is_latest(&self, release_count: usize) -> bool {
        release_count > 0 && self.current_index == Some(release_count - 1)
    }
}

/// Computes the desired deployment state for one module.
pub struct ReleasePredictor<'a> {
    releases: &'a [ModuleRelease],
    policy: &'a dyn PromotePolicy,
}

impl<'a> ReleasePredictor<'a> {
    /// Creates a predictor over releases of one module, sorted ascending by
    /// version.
    #[must_use]
    pub fn new(releases: &'a [ModuleRelease], policy: &'a dyn PromotePolicy) -> Self {
        Self { releases, policy }
    }

    /// Runs the selection pass.
    ///
    /// A pending release is nominated only when its version is strictly
    /// greater than the deployed one and the policy permits promotion. When
    /// several pending releases qualify, the highest version wins and the
    /// bypassed candidates land in `skipped_patches`.
    #[must_use]
    pub fn calculate(&self) -> ReleasePrediction {
        let mut prediction = ReleasePrediction::default();

        for (index, release) in self.releases.iter().enumerate() {
            if release.phase() == Some(Phase::Deployed) {
                prediction.current_index = Some(index);
            }
        }
        let current_version = prediction
            .current_index
            .map(|index| &self.releases[index].spec.version);

        for (index, release) in self.releases.iter().enumerate() {
            if release.phase() != Some(Phase::Pending) {
                continue;
            }
            if !self.policy.may_promote(release) {
                continue;
            }
            if let Some(current) = current_version {
                if release.spec.version <= *current {
                    continue;
                }
            }
            if let Some(previous) = prediction.desired_index.replace(index) {
                prediction.skipped_patches.push(previous);
            }
        }

        prediction
    }
}
