//! # modlink-core
//!
//! Core library for modlink - a module release reconciler for cluster
//! extension platforms.
//!
//! This crate provides the runtime-free building blocks of the reconciler:
//! the control-plane record types with their lifecycle phases, the release
//! selection predictor, the control-plane access contracts with an in-memory
//! implementation, and the per-key serialized work queue that drives the
//! reconcile loop.
//!
//! ## Example
//!
//! ```rust
//! use modlink_core::release::{ModuleRelease, ModuleReleaseSpec};
//! use modlink_core::release::predictor::{PromoteAlways, ReleasePredictor};
//! use semver::Version;
//!
//! let mut release = ModuleRelease::new(
//!     "observability-1.2.0",
//!     ModuleReleaseSpec {
//!         module_name: "observability".to_string(),
//!         version: Version::new(1, 2, 0),
//!         weight: 30,
//!         module_source: "main".to_string(),
//!     },
//! );
//! release.mark_pending();
//!
//! let releases = vec![release];
//! let prediction = ReleasePredictor::new(&releases, &PromoteAlways).calculate();
//! assert_eq!(prediction.desired_index, Some(0));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod queue;
pub mod release;

pub use cluster::MemoryCluster;
pub use queue::{ReconcileResult, WorkQueue};
pub use release::{ModuleRelease, ModuleSource, Phase};
