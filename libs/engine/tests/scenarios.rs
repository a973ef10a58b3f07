//! End-to-end release lifecycle scenarios.
//!
//! Each scenario runs against every store backend:
//! 1. install "demo"
//! 2. upgrade with changed configuration
//! 3. roll back to revision 1
//! 4. uninstall keeping history, then purge
//!
//! plus an atomic upgrade whose post-upgrade hook fails.

mod harness;

use harness::{hook_job, web_chart, Backend, Harness};
use keel_engine::{
    history, install, rollback, status, uninstall, upgrade, ActionOptions, EngineError,
};
use keel_reconcile::ResourceState;
use keel_release::{HookPhase, Release, ReleaseStatus, ReleaseStore};
use rstest::rstest;
use serde_json::json;

const NS: &str = "default";

fn statuses(history: &[Release]) -> Vec<(u32, ReleaseStatus)> {
    history.iter().map(|r| (r.revision, r.status())).collect()
}

fn image(h: &Harness) -> String {
    h.cluster.object("Deployment", "demo-web").unwrap()["spec"]["template"]["image"]
        .as_str()
        .unwrap()
        .to_string()
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::kv_memory(Backend::KvMemory)]
#[case::kv_directory(Backend::KvDirectory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_release_lifecycle(#[case] backend: Backend) {
    let h = Harness::new(backend).await;
    let chart = web_chart("1.0.0");
    let opts = ActionOptions::default();

    // Install
    let installed = install(&h.cfg, "demo", NS, &chart, json!({}), &opts)
        .await
        .unwrap();
    assert_eq!(installed.release.revision, 1);
    assert_eq!(installed.release.info.notes.as_deref(), Some("Visit demo-web"));
    assert_eq!(installed.plan.summary().create, 3);

    let revisions = history(&h.cfg, "demo", NS).await.unwrap();
    assert_eq!(statuses(&revisions), vec![(1, ReleaseStatus::Deployed)]);
    assert!(h.cluster.contains("Deployment", "demo-web"));
    assert!(h.cluster.contains("Service", "demo-web"));
    assert!(h.cluster.contains("ConfigMap", "demo-config"));
    assert_eq!(image(&h), "nginx:1.25");

    // Upgrade with changed configuration
    let upgraded = upgrade(
        &h.cfg,
        "demo",
        NS,
        &chart,
        json!({"image": {"tag": "1.26"}}),
        &opts,
    )
    .await
    .unwrap();
    assert_eq!(upgraded.release.revision, 2);
    assert_eq!(upgraded.plan.summary().update, 3);

    let revisions = history(&h.cfg, "demo", NS).await.unwrap();
    assert_eq!(
        statuses(&revisions),
        vec![(1, ReleaseStatus::Superseded), (2, ReleaseStatus::Deployed)]
    );
    assert_eq!(image(&h), "nginx:1.26");

    // Roll back to revision 1
    let rolled_back = rollback(&h.cfg, "demo", NS, 1, &opts).await.unwrap();
    assert_eq!(rolled_back.release.revision, 3);

    let revisions = history(&h.cfg, "demo", NS).await.unwrap();
    assert_eq!(
        statuses(&revisions),
        vec![
            (1, ReleaseStatus::Superseded),
            (2, ReleaseStatus::Superseded),
            (3, ReleaseStatus::Deployed),
        ]
    );
    assert_eq!(revisions[2].manifest, revisions[0].manifest);
    assert_eq!(revisions[2].config, revisions[0].config);
    assert_eq!(revisions[2].chart, revisions[0].chart);
    assert_eq!(revisions[2].info.description, "Rollback to 1");
    assert_eq!(image(&h), "nginx:1.25");

    // Uninstall, keeping history
    let keep = ActionOptions {
        keep_history: true,
        ..ActionOptions::default()
    };
    let uninstalled = uninstall(&h.cfg, "demo", NS, &keep).await.unwrap();
    assert_eq!(uninstalled.release.status(), ReleaseStatus::Uninstalled);
    assert!(uninstalled.release.info.deleted_at.is_some());

    assert!(h.store.deployed("demo", NS).await.unwrap().is_none());
    let revisions = history(&h.cfg, "demo", NS).await.unwrap();
    assert_eq!(revisions.len(), 3);
    assert_eq!(revisions[2].status(), ReleaseStatus::Uninstalled);
    assert!(h.cluster.keys().is_empty());

    // A second uninstall without keep_history purges the record
    uninstall(&h.cfg, "demo", NS, &opts).await.unwrap();
    assert!(history(&h.cfg, "demo", NS).await.unwrap().is_empty());
    assert!(status(&h.cfg, "demo", NS, None)
        .await
        .unwrap_err()
        .is_not_found());
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::kv_memory(Backend::KvMemory)]
#[case::kv_directory(Backend::KvDirectory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_atomic_upgrade_with_failing_hook_restores_previous(#[case] backend: Backend) {
    let h = Harness::new(backend).await;
    let opts = ActionOptions::default();
    let chart = web_chart("1.0.0");

    install(&h.cfg, "demo", NS, &chart, json!({}), &opts)
        .await
        .unwrap();
    upgrade(&h.cfg, "demo", NS, &chart, json!({"image": {"tag": "1.26"}}), &opts)
        .await
        .unwrap();
    let before = history(&h.cfg, "demo", NS).await.unwrap();

    let failing = web_chart("1.1.0").with_template(
        "templates/check.yaml",
        hook_job("{{ release.name }}-check", "post-upgrade", 0, "hook-failed"),
    );
    h.cluster.set_state(
        "Job",
        "demo-check",
        ResourceState::Failed("BackoffLimitExceeded".to_string()),
    );

    let atomic = ActionOptions {
        atomic: true,
        ..ActionOptions::default()
    };
    let err = upgrade(
        &h.cfg,
        "demo",
        NS,
        &failing,
        json!({"image": {"tag": "1.27"}}),
        &atomic,
    )
    .await
    .unwrap_err();

    match &err {
        EngineError::RolledBack {
            cause,
            restored_revision,
        } => {
            assert_eq!(*restored_revision, Some(2));
            assert!(matches!(
                cause.as_ref(),
                EngineError::HookFailure {
                    revision: 3,
                    phase: HookPhase::PostUpgrade,
                    ..
                }
            ));
        }
        other => panic!("expected RolledBack, got {other:?}"),
    }

    let after = history(&h.cfg, "demo", NS).await.unwrap();
    assert_eq!(statuses(&after), statuses(&before));
    assert_eq!(after[1].status(), ReleaseStatus::Deployed);
    assert_eq!(image(&h), "nginx:1.26");
    assert!(!h.cluster.contains("Job", "demo-check"));
}

#[tokio::test]
async fn test_non_atomic_upgrade_failure_is_recorded() {
    let h = Harness::new(Backend::Memory).await;
    let opts = ActionOptions::default();

    install(&h.cfg, "demo", NS, &web_chart("1.0.0"), json!({}), &opts)
        .await
        .unwrap();

    let failing = web_chart("1.1.0").with_template(
        "templates/check.yaml",
        hook_job("demo-check", "post-upgrade", 0, "before-hook-creation"),
    );
    h.cluster
        .set_state("Job", "demo-check", ResourceState::Failed("exit 1".to_string()));

    let err = upgrade(&h.cfg, "demo", NS, &failing, json!({}), &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::HookFailure { revision: 2, .. }));

    let revisions = history(&h.cfg, "demo", NS).await.unwrap();
    assert_eq!(
        statuses(&revisions),
        vec![(1, ReleaseStatus::Deployed), (2, ReleaseStatus::Failed)]
    );
    assert!(!revisions[1].manifest.is_empty());
    assert!(revisions[1].info.description.contains("post-upgrade hook"));
    // Left in place for inspection
    assert!(h.cluster.contains("Job", "demo-check"));

    // Rolling back to the previous revision recovers
    let recovered = rollback(&h.cfg, "demo", NS, 0, &opts).await.unwrap();
    assert_eq!(recovered.release.revision, 3);
    assert_eq!(recovered.release.info.description, "Rollback to 1");
    let revisions = history(&h.cfg, "demo", NS).await.unwrap();
    assert_eq!(
        statuses(&revisions),
        vec![
            (1, ReleaseStatus::Superseded),
            (2, ReleaseStatus::Failed),
            (3, ReleaseStatus::Deployed),
        ]
    );
}
