// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Rollouts, reverts and teardown of realm instances.

mod util;

use std::time::Duration;

use realm_controller::audit::LifecycleEventKind;
use realm_controller::Error;
use realm_orchestrator::{Notification, NotificationKind};
use realm_types::{InstancePhase, RealmSpec};

use crate::util::{key, realm, test_config, Behavior, Call, Harness};

#[tokio::test(start_paused = true)]
async fn first_deployment_becomes_latest() {
    let h = Harness::new();
    let r = realm("r1", "app:1");
    h.declare(r.clone()).await;
    h.converge("r1").await;

    let k = key("r1", &r, 0);
    let status = h.status("r1").await;
    assert_eq!(status.instances.len(), 1);
    assert_eq!(status.latest().map(|i| i.key()), Some(k.clone()));
    assert_eq!(status.current_spec_hash, Some(r.spec_hash.clone()));
    assert_eq!(h.backend.route("r1"), Some(k.clone()));
    assert_eq!(h.events(LifecycleEventKind::StartingNewInstance, &k), 1);
    assert_eq!(h.events(LifecycleEventKind::InstanceReady, &k), 1);
}

#[tokio::test(start_paused = true)]
async fn spec_change_replaces_the_latest_instance() {
    let h = Harness::new();
    let v1 = realm("r1", "app:1");
    h.declare(v1.clone()).await;
    h.converge("r1").await;

    let v2 = realm("r1", "app:2");
    h.declare(v2.clone()).await;
    h.converge("r1").await;

    let (old, new) = (key("r1", &v1, 0), key("r1", &v2, 0));
    let status = h.status("r1").await;
    assert_eq!(status.latest().map(|i| i.key()), Some(new.clone()));
    assert!(status.instance(&old).is_none());
    assert_eq!(h.backend.route("r1"), Some(new.clone()));
    assert_eq!(h.backend.workloads(), vec![new.clone()]);
    assert_eq!(h.events(LifecycleEventKind::DeletingInstance, &old), 1);
    assert_eq!(h.events(LifecycleEventKind::InstanceDeleted, &old), 1);

    // The route moved before the old instance was deleted.
    let calls = h.backend.calls();
    let routed = calls.iter().position(|c| *c == Call::SetRoute(new.clone()));
    let deleted = calls.iter().position(|c| *c == Call::DeleteInstance(old.clone()));
    assert!(routed < deleted);
}

#[tokio::test(start_paused = true)]
async fn instances_with_sessions_are_kept() {
    let h = Harness::new();
    let v1 = realm("r1", "app:1");
    h.declare(v1.clone()).await;
    h.converge("r1").await;
    let old = key("r1", &v1, 0);
    h.client.set_sessions(&old, 3);

    let v2 = realm("r1", "app:2");
    h.declare(v2.clone()).await;
    h.tick("r1", 10).await;

    let status = h.status("r1").await;
    assert_eq!(
        status.latest().map(|i| i.key()),
        Some(key("r1", &v2, 0))
    );
    assert_eq!(
        status.instance(&old).map(|i| i.phase),
        Some(InstancePhase::Draining)
    );
    assert!(!h.backend.calls().contains(&Call::DeleteInstance(old.clone())));

    h.client.set_sessions(&old, 0);
    h.converge("r1").await;
    assert!(h.status("r1").await.instance(&old).is_none());
}

#[tokio::test(start_paused = true)]
async fn unreachable_replicas_count_as_busy() {
    let h = Harness::new();
    let v1 = realm("r1", "app:1");
    h.declare(v1.clone()).await;
    h.converge("r1").await;
    let old = key("r1", &v1, 0);
    h.client.set_unreachable(&old, true);

    h.declare(realm("r1", "app:2")).await;
    h.tick("r1", 10).await;
    assert!(h.status("r1").await.instance(&old).is_some());

    h.controller.recycle_now(&old).await;
    h.converge("r1").await;
    assert!(h.status("r1").await.instance(&old).is_none());
    assert_eq!(h.events(LifecycleEventKind::InstanceDeleted, &old), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_rollout_keeps_serving_and_revert_starts_a_new_revision() {
    let h = Harness::new();
    let v1 = realm("r1", "app:1");
    h.declare(v1.clone()).await;
    h.converge("r1").await;

    let v2 = realm("r1", "app:broken");
    h.backend
        .set_behavior(&v2.spec_hash, Behavior::Crash("CrashLoopBackOff".into()));
    h.declare(v2.clone()).await;
    h.converge("r1").await;

    let (good, bad) = (key("r1", &v1, 0), key("r1", &v2, 0));
    let status = h.status("r1").await;
    assert_eq!(status.latest().map(|i| i.key()), Some(good.clone()));
    let failed = status.instance(&bad).unwrap();
    assert_eq!(failed.phase, InstancePhase::Failed);
    assert!(failed.failure.as_deref().unwrap().contains("CrashLoopBackOff"));
    assert_eq!(h.backend.route("r1"), Some(good.clone()));
    assert!(!h.backend.workloads().contains(&bad));

    // Further passes neither retry nor re-report the failure.
    h.tick("r1", 5).await;
    assert_eq!(h.events(LifecycleEventKind::StartingNewInstanceFailed, &bad), 1);
    assert_eq!(h.status("r1").await.instances.len(), 2);

    // Reverting to the serving spec provisions a fresh revision of it.
    h.declare(v1.clone()).await;
    h.converge("r1").await;
    let revived = key("r1", &v1, 1);
    let status = h.status("r1").await;
    assert_eq!(status.latest().map(|i| i.key()), Some(revived.clone()));
    assert!(status.instance(&good).is_none());
    assert!(status.instance(&bad).is_none());
    assert_eq!(h.backend.route("r1"), Some(revived));
}

#[tokio::test(start_paused = true)]
async fn failures_are_retried_on_resubmission() {
    let h = Harness::new();
    let r = realm("r1", "app:1");
    h.backend
        .set_behavior(&r.spec_hash, Behavior::Crash("ImagePullBackOff".into()));
    h.declare(r.clone()).await;
    h.converge("r1").await;
    assert_eq!(
        h.status("r1").await.instance(&key("r1", &r, 0)).map(|i| i.phase),
        Some(InstancePhase::Failed)
    );

    h.tick("r1", 3).await;
    assert_eq!(h.status("r1").await.instances.len(), 1);

    h.backend.set_behavior(&r.spec_hash, Behavior::Healthy);
    h.notify(NotificationKind::UpdateSpec, "r1").await;
    h.converge("r1").await;
    let status = h.status("r1").await;
    assert_eq!(status.latest().map(|i| i.key()), Some(key("r1", &r, 1)));
    assert_eq!(status.latest_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stuck_instances_fail_once_the_probe_budget_is_spent() {
    let h = Harness::new();
    let r = realm("r1", "app:1");
    h.backend.set_behavior(&r.spec_hash, Behavior::Stuck);
    h.declare(r.clone()).await;
    h.converge("r1").await;

    let status = h.status("r1").await;
    let instance = status.instance(&key("r1", &r, 0)).unwrap();
    assert_eq!(instance.phase, InstancePhase::Failed);
    assert!(instance.failure.as_deref().unwrap().contains("not healthy"));
    assert_eq!(status.latest_count(), 0);
    assert_eq!(h.backend.route("r1"), None);
}

#[tokio::test(start_paused = true)]
async fn superseded_instances_are_never_promoted() {
    let mut config = test_config();
    config.probe.attempts = 60;
    let h = Harness::with_config(config);
    let v1 = realm("r1", "app:1");
    h.declare(v1.clone()).await;
    h.converge("r1").await;

    let v2 = realm("r1", "app:2");
    h.backend.set_behavior(&v2.spec_hash, Behavior::Stuck);
    h.declare(v2.clone()).await;
    let v3 = realm("r1", "app:3");
    h.backend.set_behavior(&v3.spec_hash, Behavior::Stuck);
    h.declare(v3.clone()).await;

    // The superseded instance becomes ready first.
    h.backend.set_behavior(&v2.spec_hash, Behavior::Healthy);
    h.tick("r1", 3).await;
    let middle = key("r1", &v2, 0);
    assert!(!h.backend.calls().contains(&Call::SetRoute(middle.clone())));
    assert_eq!(h.backend.route("r1"), Some(key("r1", &v1, 0)));

    h.backend.set_behavior(&v3.spec_hash, Behavior::Healthy);
    h.converge("r1").await;
    let status = h.status("r1").await;
    assert_eq!(status.latest().map(|i| i.key()), Some(key("r1", &v3, 0)));
    assert_eq!(status.instances.len(), 1);
    assert_eq!(h.events(LifecycleEventKind::InstanceReady, &middle), 0);
}

#[tokio::test(start_paused = true)]
async fn instances_superseded_before_provisioning_are_abandoned() {
    let h = Harness::new();
    let v1 = realm("r1", "app:1");
    let v2 = realm("r1", "app:2");
    // A pass that crashed after recording the new instance.
    let mut status = realm_types::RealmStatus::new("r1".into(), "default");
    status.allocate_instance(&v1.spec_hash, chrono::Utc::now());
    status.current_spec_hash = Some(v1.spec_hash.clone());
    realm_orchestrator::StatusStore::write(&*h.store, &status, None)
        .await
        .unwrap();

    h.declare(v2.clone()).await;
    h.converge("r1").await;

    let abandoned = key("r1", &v1, 0);
    let status = h.status("r1").await;
    assert!(status.instance(&abandoned).is_none());
    assert_eq!(status.latest().map(|i| i.key()), Some(key("r1", &v2, 0)));
    assert!(h.backend.calls().contains(&Call::DeleteInstance(abandoned.clone())));
    assert!(!h.backend.calls().contains(&Call::EnsureWorkload(abandoned.clone())));
    assert_eq!(h.events(LifecycleEventKind::DeletingInstance, &abandoned), 1);
    assert_eq!(h.events(LifecycleEventKind::InstanceDeleted, &abandoned), 1);
}

#[tokio::test(start_paused = true)]
async fn teardown_is_reported_once_after_a_failed_status_write() {
    let h = Harness::new();
    let v1 = realm("r1", "app:1");
    h.declare(v1.clone()).await;
    h.converge("r1").await;
    let old = key("r1", &v1, 0);
    h.client.set_sessions(&old, 3);
    h.declare(realm("r1", "app:2")).await;
    h.tick("r1", 10).await;

    // The only write left is the teardown, and its status write fails.
    h.client.set_sessions(&old, 0);
    h.store.inject_conflicts(test_config().status_write_attempts);
    let mut failed = None;
    for _ in 0..20 {
        let reconcile = Notification::new(NotificationKind::Reconcile, "r1".into());
        if let Err(e) = h.controller.handle(&reconcile).await {
            failed = Some(e);
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    assert!(matches!(failed, Some(Error::StatusWriteExhausted { .. })));
    assert!(h.backend.calls().contains(&Call::DeleteInstance(old.clone())));
    assert_eq!(h.events(LifecycleEventKind::DeletingInstance, &old), 0);
    assert_eq!(h.events(LifecycleEventKind::InstanceDeleted, &old), 0);

    h.converge("r1").await;
    assert!(h.status("r1").await.instance(&old).is_none());
    assert_eq!(h.events(LifecycleEventKind::DeletingInstance, &old), 1);
    assert_eq!(h.events(LifecycleEventKind::InstanceDeleted, &old), 1);
}

#[tokio::test(start_paused = true)]
async fn deleting_a_realm_tears_everything_down() {
    let h = Harness::new();
    let r = realm("r1", "app:1");
    h.declare(r.clone()).await;
    h.converge("r1").await;

    h.source.remove("r1");
    h.notify(NotificationKind::Delete, "r1").await;

    let k = key("r1", &r, 0);
    assert!(h.controller.status(&"r1".into()).await.unwrap().is_none());
    assert!(h.backend.workloads().is_empty());
    assert_eq!(h.backend.route("r1"), None);
    assert!(h.backend.calls().contains(&Call::DeleteRealm("r1".into())));
    assert_eq!(h.events(LifecycleEventKind::DeletingInstance, &k), 1);
    assert_eq!(h.events(LifecycleEventKind::InstanceDeleted, &k), 1);

    // A redelivered deletion finds nothing left to do.
    let calls = h.backend.calls().len();
    h.notify(NotificationKind::Delete, "r1").await;
    assert_eq!(h.backend.calls().len(), calls);
}

#[tokio::test(start_paused = true)]
async fn realm_deletion_retried_after_a_backend_error_reports_once() {
    let h = Harness::new();
    let r = realm("r1", "app:1");
    h.declare(r.clone()).await;
    h.converge("r1").await;
    h.source.remove("r1");

    h.backend.set_failing(true);
    let delete = Notification::new(NotificationKind::Delete, "r1".into());
    assert!(h.controller.handle(&delete).await.is_err());
    h.backend.set_failing(false);
    h.notify(NotificationKind::Delete, "r1").await;

    let k = key("r1", &r, 0);
    assert!(h.backend.workloads().is_empty());
    assert_eq!(h.events(LifecycleEventKind::DeletingInstance, &k), 1);
    assert_eq!(h.events(LifecycleEventKind::InstanceDeleted, &k), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_declarations_are_rejected_without_side_effects() {
    let h = Harness::new();
    let r = realm_types::Realm::new(
        "r1".into(),
        "default",
        RealmSpec {
            image: "app:1".into(),
            replicas: 0,
            ..Default::default()
        },
    );
    let outcome = h.declare(r.clone()).await;
    assert_eq!(outcome.requeue_after, None);
    h.notify(NotificationKind::Reconcile, "r1").await;

    assert!(h.backend.calls().is_empty());
    assert_eq!(h.store.writes(), 0);
    let rejected = h
        .controller
        .audit()
        .events()
        .into_iter()
        .filter(|e| e.kind == LifecycleEventKind::InvalidSpec)
        .count();
    assert_eq!(rejected, 1);
}
