//! Pipeline scenarios against in-process collaborators

use std::sync::atomic::Ordering;

use conveyor::ci::cluster::{ApplyOptions, NamespaceOutcome};
use conveyor::deploy::apply::{Dispatch, ManifestApplier};
use conveyor::deploy::pipeline::DriveOutcome;
use conveyor::deploy::template::split_documents;
use conveyor::store::TaskStore;
use conveyor_models::TaskStatus;

use crate::fakes::{catalog, FakeBuildServer, FakeCluster, Harness, NAMESPACE_AND_DEPLOYMENT};

const FULL_STACK: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: checkout-config
data:
  LOG_LEVEL: info
---
apiVersion: v1
kind: Service
metadata:
  name: checkout
  namespace: shop
spec:
  selector:
    app: checkout
  ports:
    - name: http
      port: 80
      targetPort: 8080
---
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: checkout
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: checkout
spec:
  selector:
    matchLabels:
      app: checkout
  template:
    metadata:
      labels:
        app: checkout
    spec:
      containers:
        - name: web
          image: harbor.local/library/checkout:old
"#;

fn assert_monotonic(statuses: &[TaskStatus]) {
    for pair in statuses.windows(2) {
        assert!(
            pair[0].rank() < pair[1].rank(),
            "status went from {} to {}",
            pair[0],
            pair[1]
        );
    }
}

#[tokio::test]
async fn test_pipeline_success() {
    let harness = Harness::new(FakeBuildServer::succeeding(), NAMESPACE_AND_DEPLOYMENT);
    let task = harness.submit_published().await;

    let outcome = harness.runner.pipeline().drive(task.id).await.unwrap();
    assert_eq!(
        outcome,
        DriveOutcome::Finished {
            status: TaskStatus::Success,
            message: "deployment completed".to_string(),
        }
    );

    let stored = harness.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Success);
    assert_eq!(stored.message, "deployment completed");
    assert!(stored.started_at.is_some());
    assert!(stored.finished_at.is_some());
    assert!(stored.finished_at >= stored.started_at);
    assert_eq!(stored.image_tag, task.image_tag);

    // job did not exist so it was created, then triggered once
    assert_eq!(harness.build_server.created_job_names(), vec!["go-svc"]);
    assert_eq!(harness.build_server.trigger_count(), 1);
    let triggered = harness.build_server.triggered.lock().unwrap().clone();
    assert_eq!(triggered[0].1.image_tag, task.image_tag);
    assert_eq!(triggered[0].1.target_branch, "main");

    assert_eq!(
        harness.store.statuses(task.id),
        vec![
            TaskStatus::Pending,
            TaskStatus::Building,
            TaskStatus::Pushing,
            TaskStatus::Deploying,
            TaskStatus::Success,
        ]
    );

    // template placeholders resolved, image rewritten to the task's tag
    assert!(harness.cluster.namespaces.lock().unwrap().contains("shop"));
    let deployment = harness
        .cluster
        .object("Deployment", "shop", "checkout")
        .unwrap();
    assert_eq!(deployment["spec"]["replicas"], 2);
    assert_eq!(
        deployment["spec"]["template"]["spec"]["containers"][0]["image"],
        format!("harbor.local:8443/library/checkout:{}", task.image_tag)
    );
    assert!(harness
        .cluster
        .field_managers
        .lock()
        .unwrap()
        .contains("conveyor-test"));
}

#[tokio::test]
async fn test_pipeline_existing_job_is_reused() {
    let build_server = FakeBuildServer::succeeding();
    build_server
        .existing_jobs
        .lock()
        .unwrap()
        .insert("go-svc".to_string());
    let harness = Harness::new(build_server, NAMESPACE_AND_DEPLOYMENT);
    let task = harness.submit_published().await;

    harness.runner.pipeline().drive(task.id).await.unwrap();

    assert!(harness.build_server.created_job_names().is_empty());
    assert_eq!(harness.build_server.trigger_count(), 1);
    assert_eq!(harness.task(task.id).await.status, TaskStatus::Success);
}

#[tokio::test]
async fn test_pipeline_registry_missing_tag_fails() {
    let harness = Harness::new(FakeBuildServer::succeeding(), NAMESPACE_AND_DEPLOYMENT);
    let task = harness.submit().await;
    harness.registry.publish("19700101000000");

    let outcome = harness.runner.pipeline().drive(task.id).await.unwrap();
    assert!(matches!(
        outcome,
        DriveOutcome::Finished {
            status: TaskStatus::Failed,
            ..
        }
    ));

    let stored = harness.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.message.contains("registry verification"));
    assert!(stored.finished_at.is_some());
    assert_eq!(harness.registry.calls.load(Ordering::SeqCst), 1);

    // never reached the cluster
    assert_eq!(harness.connector.connects.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.store.statuses(task.id),
        vec![
            TaskStatus::Pending,
            TaskStatus::Building,
            TaskStatus::Pushing,
            TaskStatus::Failed,
        ]
    );
}

#[tokio::test]
async fn test_pipeline_build_number_timeout() {
    let harness = Harness::new(FakeBuildServer::never_scheduled(), NAMESPACE_AND_DEPLOYMENT);
    let task = harness.submit_published().await;

    harness.runner.pipeline().drive(task.id).await.unwrap();

    let stored = harness.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.message.contains("Timeout"));
    assert!(stored.message.contains("build number assignment"));

    assert_eq!(harness.registry.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.connector.connects.load(Ordering::SeqCst), 0);
    assert_eq!(harness.cluster.applies.load(Ordering::SeqCst), 0);
    assert_eq!(harness.build_server.status_polls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pipeline_failed_build_result() {
    let harness = Harness::new(
        FakeBuildServer::with_result("FAILURE"),
        NAMESPACE_AND_DEPLOYMENT,
    );
    let task = harness.submit_published().await;

    harness.runner.pipeline().drive(task.id).await.unwrap();

    let stored = harness.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.message.contains("build #3 of go-svc finished with result FAILURE"));
    assert_eq!(
        harness.store.statuses(task.id),
        vec![TaskStatus::Pending, TaskStatus::Building, TaskStatus::Failed]
    );
}

#[tokio::test]
async fn test_pipeline_bad_manifest_fails_deploy() {
    let harness = Harness::new(
        FakeBuildServer::succeeding(),
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok\n---\nkind: [unclosed\n",
    );
    let task = harness.submit_published().await;

    harness.runner.pipeline().drive(task.id).await.unwrap();

    let stored = harness.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.message.contains("document 2"));
    // first document was applied before the failure
    assert_eq!(harness.cluster.applies.load(Ordering::SeqCst), 1);
    assert_monotonic(&harness.store.statuses(task.id));
}

#[tokio::test]
async fn test_pipeline_build_completion_timeout() {
    let harness = Harness::new(FakeBuildServer::never_completes(), NAMESPACE_AND_DEPLOYMENT);
    let task = harness.submit_published().await;

    harness.runner.pipeline().drive(task.id).await.unwrap();

    let stored = harness.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.message.contains("Timeout"));
    assert!(stored.message.contains("build completion"));
    assert!(stored.finished_at.is_some());

    assert!(harness.build_server.status_polls.load(Ordering::SeqCst) > 0);
    assert_eq!(harness.registry.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pipeline_missing_build_template_fails() {
    let harness = Harness::new(FakeBuildServer::succeeding(), NAMESPACE_AND_DEPLOYMENT);
    let mut data = catalog(NAMESPACE_AND_DEPLOYMENT);
    data.projects[0].build_template_ids.clear();
    harness.catalog.set_catalog(data).unwrap();
    let task = harness.submit_published().await;

    harness.runner.pipeline().drive(task.id).await.unwrap();

    let stored = harness.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.message.contains("no build template"));
    assert!(stored.finished_at.is_some());
    assert_eq!(harness.build_server.trigger_count(), 0);
    assert!(harness.build_server.created_job_names().is_empty());
    assert_eq!(
        harness.store.statuses(task.id),
        vec![TaskStatus::Pending, TaskStatus::Building, TaskStatus::Failed]
    );
}

#[tokio::test]
async fn test_pipeline_missing_deployment_template_fails() {
    let harness = Harness::new(FakeBuildServer::succeeding(), NAMESPACE_AND_DEPLOYMENT);
    let mut data = catalog(NAMESPACE_AND_DEPLOYMENT);
    data.projects[0].deployment_template_ids.clear();
    harness.catalog.set_catalog(data).unwrap();
    let task = harness.submit_published().await;

    harness.runner.pipeline().drive(task.id).await.unwrap();

    let stored = harness.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.message.contains("no deployment template"));
    assert_eq!(harness.cluster.applies.load(Ordering::SeqCst), 0);
    assert_eq!(harness.cluster.namespace_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.store.statuses(task.id),
        vec![
            TaskStatus::Pending,
            TaskStatus::Building,
            TaskStatus::Pushing,
            TaskStatus::Deploying,
            TaskStatus::Failed,
        ]
    );
}

#[tokio::test]
async fn test_pipeline_failed_status_write_still_ends_failed() {
    let harness = Harness::new(FakeBuildServer::succeeding(), NAMESPACE_AND_DEPLOYMENT);
    let task = harness.submit_published().await;
    harness.store.fail_next_transition_to(TaskStatus::Pushing);

    let outcome = harness.runner.pipeline().drive(task.id).await.unwrap();
    assert!(matches!(
        outcome,
        DriveOutcome::Finished {
            status: TaskStatus::Failed,
            ..
        }
    ));

    let stored = harness.task(task.id).await;
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.message.contains("temporarily unavailable"));
    assert!(stored.finished_at.is_some());
    assert_eq!(harness.registry.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        harness.store.statuses(task.id),
        vec![TaskStatus::Pending, TaskStatus::Building, TaskStatus::Failed]
    );
}

#[tokio::test]
async fn test_pipeline_non_pending_task_is_not_started() {
    let harness = Harness::new(FakeBuildServer::succeeding(), NAMESPACE_AND_DEPLOYMENT);
    let task = harness.submit_published().await;

    harness.runner.pipeline().drive(task.id).await.unwrap();
    let outcome = harness.runner.pipeline().drive(task.id).await.unwrap();

    assert_eq!(
        outcome,
        DriveOutcome::NotStarted {
            status: Some(TaskStatus::Success)
        }
    );
    assert_eq!(harness.build_server.trigger_count(), 1);
}

#[tokio::test]
async fn test_pipeline_concurrent_drives_start_one_run() {
    let harness = Harness::new(FakeBuildServer::succeeding(), NAMESPACE_AND_DEPLOYMENT);
    let task = harness.submit_published().await;
    let pipeline = harness.runner.pipeline();

    let outcomes = futures::future::join_all((0..4).map(|_| pipeline.drive(task.id))).await;

    let finished = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(DriveOutcome::Finished { .. })))
        .count();
    let not_started = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(DriveOutcome::NotStarted { .. })))
        .count();
    assert_eq!(finished, 1);
    assert_eq!(not_started, 3);
    assert_eq!(harness.build_server.trigger_count(), 1);

    let statuses = harness.store.statuses(task.id);
    assert_monotonic(&statuses);
    assert_eq!(statuses.last(), Some(&TaskStatus::Success));
}

#[tokio::test]
async fn test_pipeline_statuses_are_monotonic_per_task() {
    let harness = Harness::new(FakeBuildServer::succeeding(), NAMESPACE_AND_DEPLOYMENT);
    let first = harness.submit_published().await;
    let second = harness.submit().await;
    assert_ne!(first.id, second.id);

    let handles = harness.runner.sweep().await.unwrap();
    assert_eq!(handles.len(), 2);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for id in [first.id, second.id] {
        let statuses = harness.store.statuses(id);
        assert_monotonic(&statuses);
        assert!(statuses.last().unwrap().is_terminal());
    }
    assert!(harness
        .store
        .list_by_status(TaskStatus::Pending)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_create_task_runs_to_completion() {
    let harness = Harness::new(FakeBuildServer::succeeding(), NAMESPACE_AND_DEPLOYMENT);
    // tags are minted per second, publish the current and next second
    let now = chrono::Utc::now();
    for offset in 0..3 {
        let tag = (now + chrono::Duration::seconds(offset))
            .format(conveyor::deploy::runner::IMAGE_TAG_FORMAT)
            .to_string();
        harness.registry.publish(&tag);
    }

    let (task, handle) = harness
        .runner
        .create_task(crate::fakes::request())
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Pending);

    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        DriveOutcome::Finished {
            status: TaskStatus::Success,
            ..
        }
    ));
    assert_eq!(harness.task(task.id).await.status, TaskStatus::Success);
}

// ================================== APPLIER ===================================== //

#[tokio::test]
async fn test_applier_dispatches_every_document() {
    let cluster = FakeCluster::default();
    let applier = ManifestApplier::new(
        &cluster,
        ApplyOptions::forced("conveyor-test"),
        "20240102030405",
        "shop",
    );

    let documents = split_documents(FULL_STACK);
    assert_eq!(documents.len(), 4);

    let dispatched = applier.apply_documents(&documents).await.unwrap();
    assert_eq!(dispatched.len(), documents.len());
    assert_eq!(
        dispatched,
        vec![
            Dispatch::Applied {
                kind: "ConfigMap".to_string(),
                namespace: "shop".to_string(),
                name: "checkout-config".to_string(),
            },
            Dispatch::Applied {
                kind: "Service".to_string(),
                namespace: "shop".to_string(),
                name: "checkout".to_string(),
            },
            Dispatch::Skipped {
                kind: "Ingress".to_string(),
            },
            Dispatch::Applied {
                kind: "Deployment".to_string(),
                namespace: "shop".to_string(),
                name: "checkout".to_string(),
            },
        ]
    );

    let deployment = cluster.object("Deployment", "shop", "checkout").unwrap();
    assert_eq!(deployment["spec"]["replicas"], 1);
    assert_eq!(
        deployment["spec"]["template"]["spec"]["containers"][0]["image"],
        "harbor.local/library/checkout:20240102030405"
    );
    let service = cluster.object("Service", "shop", "checkout").unwrap();
    assert_eq!(service["spec"]["ports"][0]["port"], 80);
    assert_eq!(service["spec"]["ports"][0]["targetPort"], 8080);
}

#[tokio::test]
async fn test_applier_reapply_is_idempotent() {
    let cluster = FakeCluster::default();
    let applier = ManifestApplier::new(
        &cluster,
        ApplyOptions::forced("conveyor-test"),
        "20240102030405",
        "shop",
    );
    let mut documents = vec!["apiVersion: v1\nkind: Namespace\nmetadata:\n  name: shop\n".to_string()];
    documents.extend(split_documents(FULL_STACK));

    let first = applier.apply_documents(&documents).await.unwrap();
    let snapshot = cluster.snapshot();
    let second = applier.apply_documents(&documents).await.unwrap();

    assert_eq!(cluster.snapshot(), snapshot);
    assert_eq!(snapshot.len(), 3);
    assert_eq!(
        first[0],
        Dispatch::Namespace {
            name: "shop".to_string(),
            outcome: NamespaceOutcome::Created,
        }
    );
    assert_eq!(
        second[0],
        Dispatch::Namespace {
            name: "shop".to_string(),
            outcome: NamespaceOutcome::Existing,
        }
    );
    assert_eq!(first[1..], second[1..]);
}
