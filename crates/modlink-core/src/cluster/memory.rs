//! In-memory control plane with resource versions and event fan-out.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use super::{ClusterError, EventSubscriber, ReleaseEvent, ReleaseStore, SourceStore};
use crate::release::{ModuleRelease, ModuleSource};

const RELEASE_KIND: &str = "ModuleRelease";
const SOURCE_KIND: &str = "ModuleSource";

/// An in-memory cluster of module releases and sources.
///
/// Writes follow the control-plane contract: every effective write bumps a
/// monotonic resource version, writes carrying a stale version are rejected
/// with [`ClusterError::Conflict`], and no-op writes leave the record (and
/// its version) untouched so idempotent reconcile passes stay silent.
/// Deletion is two-phase: [`MemoryCluster::mark_for_deletion`] stamps the
/// deletion timestamp and the record disappears once its last finalizer is
/// removed through [`ReleaseStore::update`].
#[derive(Default)]
pub struct MemoryCluster {
    state: RwLock<ClusterState>,
    subscribers: RwLock<Vec<EventSubscriber>>,
}

#[derive(Default)]
struct ClusterState {
    releases: HashMap<String, ModuleRelease>,
    sources: HashMap<String, ModuleSource>,
    last_resource_version: u64,
}

impl MemoryCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber for release cache events.
    pub fn subscribe(&self, subscriber: EventSubscriber) {
        self.subscribers.write().push(subscriber);
    }

    fn publish(&self, event: &ReleaseEvent) {
        for subscriber in self.subscribers.read().iter() {
            subscriber(event);
        }
    }

    /// Inserts a release, assigning its first resource version.
    pub fn create_release(&self, mut release: ModuleRelease) -> ModuleRelease {
        let created = {
            let mut state = self.state.write();
            state.last_resource_version += 1;
            release.meta.resource_version = state.last_resource_version;
            state
                .releases
                .insert(release.name().to_string(), release.clone());
            release
        };
        self.publish(&ReleaseEvent::Added(created.clone()));
        created
    }

    /// Inserts a source, assigning its first resource version.
    pub fn create_source(&self, mut source: ModuleSource) -> ModuleSource {
        let mut state = self.state.write();
        state.last_resource_version += 1;
        source.meta.resource_version = state.last_resource_version;
        state
            .sources
            .insert(source.name().to_string(), source.clone());
        source
    }

    /// Requests deletion of a release.
    ///
    /// Records without finalizers disappear immediately; records with
    /// finalizers are stamped with a deletion timestamp and wait for their
    /// owners to release them.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::NotFound`] when the release does not exist.
    pub fn mark_for_deletion(&self, name: &str) -> Result<ModuleRelease, ClusterError> {
        let (event, result) = {
            let mut state = self.state.write();
            let Some(existing) = state.releases.get(name).cloned() else {
                return Err(ClusterError::NotFound {
                    kind: RELEASE_KIND,
                    name: name.to_string(),
                });
            };
            let mut updated = existing.clone();
            if updated.meta.deletion_timestamp.is_none() {
                updated.meta.deletion_timestamp = Some(Utc::now());
            }
            state.last_resource_version += 1;
            updated.meta.resource_version = state.last_resource_version;
            if updated.meta.finalizers.is_empty() {
                state.releases.remove(name);
                (ReleaseEvent::Deleted(updated.clone()), updated)
            } else {
                state
                    .releases
                    .insert(name.to_string(), updated.clone());
                (
                    ReleaseEvent::Updated {
                        old: existing,
                        new: updated.clone(),
                    },
                    updated,
                )
            }
        };
        self.publish(&event);
        Ok(result)
    }

    /// Replays every cached release as an unchanged update event, the way a
    /// periodic informer resync does.
    pub fn resync(&self) {
        let releases: Vec<ModuleRelease> = {
            let state = self.state.read();
            state.releases.values().cloned().collect()
        };
        for release in releases {
            self.publish(&ReleaseEvent::Updated {
                old: release.clone(),
                new: release,
            });
        }
    }

    fn apply_release<F>(
        &self,
        incoming: &ModuleRelease,
        merge: F,
    ) -> Result<ModuleRelease, ClusterError>
    where
        F: FnOnce(&ModuleRelease, &ModuleRelease) -> ModuleRelease,
    {
        let (event, result) = {
            let mut state = self.state.write();
            let Some(stored) = state.releases.get(incoming.name()).cloned() else {
                return Err(ClusterError::NotFound {
                    kind: RELEASE_KIND,
                    name: incoming.name().to_string(),
                });
            };
            if incoming.meta.resource_version != stored.meta.resource_version {
                return Err(ClusterError::Conflict {
                    kind: RELEASE_KIND,
                    name: incoming.name().to_string(),
                    stale: incoming.meta.resource_version,
                    current: stored.meta.resource_version,
                });
            }
            let mut merged = merge(&stored, incoming);
            merged.meta.resource_version = stored.meta.resource_version;
            if merged == stored {
                return Ok(stored);
            }
            state.last_resource_version += 1;
            merged.meta.resource_version = state.last_resource_version;
            if merged.is_deleting() && merged.meta.finalizers.is_empty() {
                state.releases.remove(merged.name());
                (ReleaseEvent::Deleted(merged.clone()), merged)
            } else {
                state
                    .releases
                    .insert(merged.name().to_string(), merged.clone());
                (
                    ReleaseEvent::Updated {
                        old: stored,
                        new: merged.clone(),
                    },
                    merged,
                )
            }
        };
        self.publish(&event);
        Ok(result)
    }
}

impl ReleaseStore for MemoryCluster {
    fn get(&self, name: &str) -> Result<ModuleRelease, ClusterError> {
        self.state
            .read()
            .releases
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: RELEASE_KIND,
                name: name.to_string(),
            })
    }

    fn list_labelled(&self, key: &str, value: &str) -> Result<Vec<ModuleRelease>, ClusterError> {
        let mut releases: Vec<ModuleRelease> = self
            .state
            .read()
            .releases
            .values()
            .filter(|r| r.meta.labels.get(key).is_some_and(|v| v == value))
            .cloned()
            .collect();
        releases.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(releases)
    }

    fn list_all(&self) -> Result<Vec<ModuleRelease>, ClusterError> {
        let mut releases: Vec<ModuleRelease> =
            self.state.read().releases.values().cloned().collect();
        releases.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(releases)
    }

    fn update(&self, release: &ModuleRelease) -> Result<ModuleRelease, ClusterError> {
        self.apply_release(release, |stored, incoming| ModuleRelease {
            meta: incoming.meta.clone(),
            spec: incoming.spec.clone(),
            status: stored.status.clone(),
        })
    }

    fn update_status(&self, release: &ModuleRelease) -> Result<ModuleRelease, ClusterError> {
        self.apply_release(release, |stored, incoming| ModuleRelease {
            meta: stored.meta.clone(),
            spec: stored.spec.clone(),
            status: incoming.status.clone(),
        })
    }
}

impl SourceStore for MemoryCluster {
    fn get_source(&self, name: &str) -> Result<ModuleSource, ClusterError> {
        self.state
            .read()
            .sources
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: SOURCE_KIND,
                name: name.to_string(),
            })
    }

    fn update_source(&self, source: &ModuleSource) -> Result<ModuleSource, ClusterError> {
        let mut state = self.state.write();
        let Some(stored) = state.sources.get(source.name()).cloned() else {
            return Err(ClusterError::NotFound {
                kind: SOURCE_KIND,
                name: source.name().to_string(),
            });
        };
        if source.meta.resource_version != stored.meta.resource_version {
            return Err(ClusterError::Conflict {
                kind: SOURCE_KIND,
                name: source.name().to_string(),
                stale: source.meta.resource_version,
                current: stored.meta.resource_version,
            });
        }
        if *source == stored {
            return Ok(stored);
        }
        let mut updated = source.clone();
        state.last_resource_version += 1;
        updated.meta.resource_version = state.last_resource_version;
        state
            .sources
            .insert(updated.name().to_string(), updated.clone());
        Ok(updated)
    }
}
