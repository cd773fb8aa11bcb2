//! End-to-end reconcile scenarios: a release is created in the control
//! plane, the event loop converges, and the filesystem, phases, finalizers,
//! and restart signalling are checked against the contract.

mod common;

use std::fs;
use std::time::Duration;

use modlink_core::cluster::{ReleaseStore, SourceStore};
use modlink_core::release::{Phase, FS_RELEASE_FINALIZER, SOURCE_RELEASE_FINALIZER, STATUS_LABEL};
use modlink_daemon::materializer::Materializer;

use common::Harness;

/// Lets the paused clock run past the debounce window so coalesced restart
/// signals fire.
async fn settle_restarts() {
    tokio::time::sleep(Duration::from_secs(6)).await;
}

#[tokio::test(start_paused = true)]
async fn first_release_is_deployed_end_to_end() {
    let harness = Harness::new(false);
    harness.create_source("s1");
    harness.seed_payload("mod-a", "1.0.0");
    let name = harness.create_release("mod-a", "1.0.0", 10, "s1");
    harness.drain();

    let release = harness.release(&name);
    assert_eq!(release.phase(), Some(Phase::Deployed));
    assert!(release.meta.has_finalizer(FS_RELEASE_FINALIZER));
    assert_eq!(
        release.meta.labels.get(STATUS_LABEL).map(String::as_str),
        Some("deployed")
    );

    let link = harness.materializer.symlink_path(10, "mod-a");
    assert_eq!(
        fs::read_link(&link).expect("symlink exists"),
        Materializer::relative_payload_path("mod-a", "1.0.0")
    );

    let source = harness.cluster.get_source("s1").expect("source");
    assert!(source.meta.has_finalizer(SOURCE_RELEASE_FINALIZER));

    assert_eq!(
        harness.config_service.assignments().get("mod-a"),
        Some(&"s1".to_string())
    );
    assert_eq!(
        harness.controller.module_sources().get("mod-a"),
        Some(&"s1".to_string())
    );

    settle_restarts().await;
    assert_eq!(harness.signals.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn patch_overtake_skips_the_intermediate_release() {
    let harness = Harness::new(false);
    harness.create_source("s1");
    harness.seed_payload("mod-a", "1.0.0");
    let first = harness.create_release("mod-a", "1.0.0", 10, "s1");
    harness.drain();

    harness.seed_payload("mod-a", "1.0.1");
    harness.seed_payload("mod-a", "1.0.2");
    let skipped = harness.create_release("mod-a", "1.0.1", 10, "s1");
    let latest = harness.create_release("mod-a", "1.0.2", 10, "s1");
    harness.drain();

    assert_eq!(harness.release(&latest).phase(), Some(Phase::Deployed));
    assert_eq!(harness.release(&skipped).phase(), Some(Phase::Superseded));
    assert_eq!(harness.release(&first).phase(), Some(Phase::Superseded));

    let link = harness.materializer.symlink_path(10, "mod-a");
    assert_eq!(
        fs::read_link(&link).expect("symlink exists"),
        Materializer::relative_payload_path("mod-a", "1.0.2")
    );

    // Everything happened within one debounce window: one signal.
    settle_restarts().await;
    assert_eq!(harness.signals.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn enable_failure_suspends_the_release() {
    let harness = Harness::new(false);
    harness.create_source("s1");
    // No payload directory for mod-b.
    let name = harness.create_release("mod-b", "2.0.0", 15, "s1");
    harness.drain();

    let release = harness.release(&name);
    assert_eq!(release.phase(), Some(Phase::Suspended));
    assert!(release
        .status
        .message
        .starts_with("Desired version of the module met problems:"));
    assert!(!release.meta.has_finalizer(FS_RELEASE_FINALIZER));
    assert!(harness.materializer.find_current_symlink("mod-b").is_none());

    settle_restarts().await;
    assert_eq!(harness.signals.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn deleting_a_deployed_release_cleans_the_filesystem() {
    let harness = Harness::new(false);
    harness.create_source("s1");
    harness.seed_payload("mod-a", "1.0.2");
    let name = harness.create_release("mod-a", "1.0.2", 10, "s1");
    harness.drain();
    assert_eq!(harness.release(&name).phase(), Some(Phase::Deployed));

    harness.cluster.mark_for_deletion(&name).expect("mark");
    harness.drain();

    assert!(!harness.materializer.payload_dir("mod-a", "1.0.2").exists());
    assert!(fs::symlink_metadata(harness.materializer.symlink_path(10, "mod-a")).is_err());
    assert!(
        harness.cluster.get(&name).is_err(),
        "record should be gone once the finalizer is released"
    );
}

#[tokio::test(start_paused = true)]
async fn a_second_pass_with_no_changes_writes_nothing() {
    let harness = Harness::new(false);
    harness.create_source("s1");
    harness.seed_payload("mod-a", "1.0.0");
    let name = harness.create_release("mod-a", "1.0.0", 10, "s1");
    harness.drain();

    let before = harness.release(&name);
    let link = harness.materializer.symlink_path(10, "mod-a");
    let target_before = fs::read_link(&link).expect("symlink");

    harness.queue.add(&name);
    harness.drain();

    let after = harness.release(&name);
    assert_eq!(
        after.meta.resource_version, before.meta.resource_version,
        "an idempotent pass must not write to the control plane"
    );
    assert_eq!(fs::read_link(&link).expect("symlink"), target_before);
}

#[tokio::test(start_paused = true)]
async fn out_of_band_symlink_removal_is_repaired() {
    let harness = Harness::new(false);
    harness.create_source("s1");
    harness.seed_payload("mod-a", "1.0.0");
    let name = harness.create_release("mod-a", "1.0.0", 10, "s1");
    harness.drain();
    settle_restarts().await;
    assert_eq!(harness.signals.count(), 1);

    let link = harness.materializer.symlink_path(10, "mod-a");
    fs::remove_file(&link).expect("remove symlink out of band");

    harness.queue.add(&name);
    harness.drain();

    assert_eq!(
        fs::read_link(&link).expect("symlink restored"),
        Materializer::relative_payload_path("mod-a", "1.0.0")
    );
    assert_eq!(harness.release(&name).phase(), Some(Phase::Deployed));

    settle_restarts().await;
    assert_eq!(harness.signals.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_does_not_enqueue_work() {
    let harness = Harness::new(false);
    harness.create_source("s1");
    harness.seed_payload("mod-a", "1.0.0");
    harness.create_release("mod-a", "1.0.0", 10, "s1");
    harness.drain();

    // Resync replays every record with an unchanged resource version; the
    // event hook must filter all of it out.
    harness.cluster.resync();
    assert!(harness.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn a_stale_older_pending_release_does_not_downgrade() {
    let harness = Harness::new(false);
    harness.create_source("s1");
    harness.seed_payload("mod-a", "1.0.2");
    let deployed = harness.create_release("mod-a", "1.0.2", 10, "s1");
    harness.drain();

    harness.seed_payload("mod-a", "1.0.1");
    let stale = harness.create_release("mod-a", "1.0.1", 10, "s1");
    harness.drain();

    assert_eq!(harness.release(&deployed).phase(), Some(Phase::Deployed));
    assert_eq!(harness.release(&stale).phase(), Some(Phase::Pending));

    let link = harness.materializer.symlink_path(10, "mod-a");
    assert_eq!(
        fs::read_link(&link).expect("symlink"),
        Materializer::relative_payload_path("mod-a", "1.0.2")
    );
}

#[tokio::test(start_paused = true)]
async fn a_new_weight_moves_the_symlink() {
    let harness = Harness::new(false);
    harness.create_source("s1");
    harness.seed_payload("mod-a", "1.0.0");
    harness.create_release("mod-a", "1.0.0", 10, "s1");
    harness.drain();

    harness.seed_payload("mod-a", "1.1.0");
    harness.create_release("mod-a", "1.1.0", 25, "s1");
    harness.drain();

    assert!(fs::symlink_metadata(harness.materializer.symlink_path(10, "mod-a")).is_err());
    assert_eq!(
        fs::read_link(harness.materializer.symlink_path(25, "mod-a")).expect("symlink"),
        Materializer::relative_payload_path("mod-a", "1.1.0")
    );
}
