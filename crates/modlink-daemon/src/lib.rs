//! modlink-daemon - module release reconciler
//!
//! This library wires the modlink-core building blocks into the daemon that
//! keeps a host's module tree in agreement with the control plane: exactly
//! one version of each module is enabled at any moment, exposed through a
//! weight-ordered relative symlink.
//!
//! # Modules
//!
//! - [`materializer`]: symlink and payload directory management
//! - [`controller`]: the reconcile loop and its worker pool
//! - [`preflight`]: boot-time filesystem/control-plane synchronization
//! - [`debouncer`]: coalesced host restart signalling
//! - [`statedir`]: manifest-directory control plane backend
//! - [`host`]: seams toward the host process (signals, downloads, config)

pub mod config;
pub mod controller;
pub mod debouncer;
pub mod host;
pub mod materializer;
pub mod preflight;
pub mod statedir;
