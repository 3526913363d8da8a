//! In-process stand-ins for the build server, registry and cluster

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use serde::Serialize;

use conveyor::ci::cluster::{ApplyOptions, ClusterClient, ClusterConnector, NamespaceOutcome};
use conveyor::ci::harbor::Registry;
use conveyor::ci::jenkins::{BuildParameters, BuildServer, BuildStatus, QueuedBuild};
use conveyor::deploy::pipeline::{Pipeline, PipelineSettings};
use conveyor::deploy::runner::TaskRunner;
use conveyor::errors::ConveyorError;
use conveyor::store::memory::MemoryStore;
use conveyor::store::{CasResult, CatalogData, TaskStore};
use conveyor_models::{
    BuildTemplate, ClusterCredential, DeployTask, DeploymentTemplate, Environment,
    NewDeployTask, Project, TaskId, TaskStatus, TaskUpdate,
};

// ================================ BUILD SERVER ================================== //

pub struct FakeBuildServer {
    pub existing_jobs: Mutex<BTreeSet<String>>,
    pub created_jobs: Mutex<Vec<(String, String)>>,
    pub triggered: Mutex<Vec<(String, BuildParameters)>>,
    pub queue_id: u64,
    /// `None` keeps the queue item waiting forever
    pub build_number: Option<u64>,
    pub queue_polls_before_assigned: u32,
    pub status_polls_before_complete: u32,
    pub result: String,
    pub queue_polls: AtomicU32,
    pub status_polls: AtomicU32,
}

impl FakeBuildServer {
    /// Queue id 7, build number 3, result SUCCESS
    pub fn succeeding() -> Self {
        Self {
            existing_jobs: Mutex::new(BTreeSet::new()),
            created_jobs: Mutex::new(Vec::new()),
            triggered: Mutex::new(Vec::new()),
            queue_id: 7,
            build_number: Some(3),
            queue_polls_before_assigned: 2,
            status_polls_before_complete: 2,
            result: "SUCCESS".to_string(),
            queue_polls: AtomicU32::new(0),
            status_polls: AtomicU32::new(0),
        }
    }

    pub fn never_scheduled() -> Self {
        Self {
            build_number: None,
            ..Self::succeeding()
        }
    }

    /// Build number is assigned but the build never leaves `building`
    pub fn never_completes() -> Self {
        Self {
            status_polls_before_complete: u32::MAX,
            ..Self::succeeding()
        }
    }

    pub fn with_result(result: &str) -> Self {
        Self {
            result: result.to_string(),
            ..Self::succeeding()
        }
    }

    pub fn created_job_names(&self) -> Vec<String> {
        self.created_jobs
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn trigger_count(&self) -> usize {
        self.triggered.lock().unwrap().len()
    }
}

#[async_trait]
impl BuildServer for FakeBuildServer {
    async fn job_exists(&self, name: &str) -> Result<bool, ConveyorError> {
        Ok(self.existing_jobs.lock().unwrap().contains(name))
    }

    async fn create_job(&self, name: &str, config_xml: &str) -> Result<(), ConveyorError> {
        self.existing_jobs.lock().unwrap().insert(name.to_string());
        self.created_jobs
            .lock()
            .unwrap()
            .push((name.to_string(), config_xml.to_string()));
        Ok(())
    }

    async fn authenticate(&self) -> Result<(), ConveyorError> {
        Ok(())
    }

    async fn trigger_build(
        &self,
        name: &str,
        params: &BuildParameters,
    ) -> Result<QueuedBuild, ConveyorError> {
        self.triggered
            .lock()
            .unwrap()
            .push((name.to_string(), params.clone()));
        Ok(QueuedBuild {
            queue_id: self.queue_id,
            job_name: name.to_string(),
        })
    }

    async fn poll_queue(&self, queue_id: u64) -> Result<Option<u64>, ConveyorError> {
        assert_eq!(queue_id, self.queue_id);
        let polls = self.queue_polls.fetch_add(1, Ordering::SeqCst);
        if polls < self.queue_polls_before_assigned {
            return Ok(None);
        }
        Ok(self.build_number)
    }

    async fn build_status(&self, _name: &str, number: u64) -> Result<BuildStatus, ConveyorError> {
        let polls = self.status_polls.fetch_add(1, Ordering::SeqCst);
        if polls < self.status_polls_before_complete {
            return Ok(BuildStatus {
                number,
                result: None,
                building: true,
            });
        }
        Ok(BuildStatus {
            number,
            result: Some(self.result.clone()),
            building: false,
        })
    }
}

// ================================== REGISTRY ==================================== //

#[derive(Default)]
pub struct FakeRegistry {
    pub tags: Mutex<Vec<String>>,
    pub calls: AtomicU32,
}

impl FakeRegistry {
    pub fn publish(&self, tag: &str) {
        self.tags.lock().unwrap().push(tag.to_string());
    }
}

#[async_trait]
impl Registry for FakeRegistry {
    async fn list_tags(&self, _project: &str, _image: &str) -> Result<Vec<String>, ConveyorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tags.lock().unwrap().clone())
    }
}

// ================================== CLUSTER ===================================== //

/// Key of an applied object: kind, namespace, name
pub type ObjectKey = (String, String, String);

/// Cluster that merges applied objects by key, last write wins
#[derive(Default)]
pub struct FakeCluster {
    pub namespaces: Mutex<BTreeSet<String>>,
    pub objects: Mutex<BTreeMap<ObjectKey, serde_json::Value>>,
    pub field_managers: Mutex<BTreeSet<String>>,
    pub applies: AtomicU32,
    pub namespace_calls: AtomicU32,
}

impl FakeCluster {
    fn record<T: Serialize>(
        &self,
        kind: &str,
        object: &T,
        metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError> {
        assert!(options.force_conflicts);
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.field_managers
            .lock()
            .unwrap()
            .insert(options.field_manager.clone());
        let key = (
            kind.to_string(),
            metadata.namespace.clone().unwrap_or_default(),
            metadata.name.clone().unwrap_or_default(),
        );
        let value = serde_json::to_value(object)?;
        self.objects.lock().unwrap().insert(key, value);
        Ok(())
    }

    pub fn snapshot(&self) -> BTreeMap<ObjectKey, serde_json::Value> {
        self.objects.lock().unwrap().clone()
    }

    pub fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<serde_json::Value> {
        self.objects
            .lock()
            .unwrap()
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceOutcome, ConveyorError> {
        self.namespace_calls.fetch_add(1, Ordering::SeqCst);
        if self.namespaces.lock().unwrap().insert(name.to_string()) {
            Ok(NamespaceOutcome::Created)
        } else {
            Ok(NamespaceOutcome::Existing)
        }
    }

    async fn apply_config_map(
        &self,
        config_map: &ConfigMap,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError> {
        self.record("ConfigMap", config_map, &config_map.metadata, options)
    }

    async fn apply_service(
        &self,
        service: &Service,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError> {
        self.record("Service", service, &service.metadata, options)
    }

    async fn apply_deployment(
        &self,
        deployment: &Deployment,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError> {
        self.record("Deployment", deployment, &deployment.metadata, options)
    }
}

pub struct FakeConnector {
    pub cluster: Arc<FakeCluster>,
    pub connects: AtomicU32,
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(
        &self,
        credential: &ClusterCredential,
    ) -> Result<Arc<dyn ClusterClient>, ConveyorError> {
        if !credential.enabled {
            return Err(ConveyorError::ClusterError(format!(
                "cluster {} is disabled",
                credential.id
            )));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.cluster.clone())
    }
}

// =================================== STORE ====================================== //

/// Memory store that records every status it persists
#[derive(Default)]
pub struct RecordingStore {
    pub inner: MemoryStore,
    pub history: Mutex<Vec<(TaskId, TaskStatus)>>,
    /// The next transition into this status fails with a storage error
    pub fail_once: Mutex<Option<TaskStatus>>,
}

impl RecordingStore {
    pub fn fail_next_transition_to(&self, status: TaskStatus) {
        *self.fail_once.lock().unwrap() = Some(status);
    }

    pub fn statuses(&self, id: TaskId) -> Vec<TaskStatus> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .filter(|(task_id, _)| *task_id == id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl TaskStore for RecordingStore {
    async fn insert(&self, task: DeployTask) -> Result<DeployTask, ConveyorError> {
        let task = self.inner.insert(task).await?;
        self.history.lock().unwrap().push((task.id, task.status));
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<DeployTask, ConveyorError> {
        self.inner.get(id).await
    }

    async fn update_fields(&self, id: TaskId, update: &TaskUpdate) -> Result<(), ConveyorError> {
        self.inner.update_fields(id, update).await?;
        if let Some(status) = update.status {
            self.history.lock().unwrap().push((id, status));
        }
        Ok(())
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        update: &TaskUpdate,
    ) -> Result<CasResult, ConveyorError> {
        {
            let mut fail_once = self.fail_once.lock().unwrap();
            if fail_once.is_some() && *fail_once == update.status {
                *fail_once = None;
                return Err(ConveyorError::StorageError(
                    "task file temporarily unavailable".to_string(),
                ));
            }
        }
        let result = self.inner.transition(id, expected, update).await?;
        if result.is_success() {
            if let Some(status) = update.status {
                self.history.lock().unwrap().push((id, status));
            }
        }
        Ok(result)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<DeployTask>, ConveyorError> {
        self.inner.list_by_status(status).await
    }
}

// ================================== HARNESS ===================================== //

pub const PROJECT_ID: u64 = 1;
pub const ENV_ID: u64 = 2;
pub const CLUSTER_ID: u64 = 3;

pub const NAMESPACE_AND_DEPLOYMENT: &str = r#"apiVersion: v1
kind: Namespace
metadata:
  name: {{NAMESPACE}}
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{PROJECT_NAME}}
  namespace: {{NAMESPACE}}
  labels:
    env: {{ENV_NAME}}
spec:
  replicas: 2
  selector:
    matchLabels:
      app: {{PROJECT_NAME}}
  template:
    metadata:
      labels:
        app: {{PROJECT_NAME}}
    spec:
      containers:
        - name: web
          image: harbor.local:8443/library/checkout:latest
          ports:
            - containerPort: 8080
"#;

pub fn catalog(deployment_template: &str) -> CatalogData {
    CatalogData {
        projects: vec![Project {
            id: PROJECT_ID,
            name: "checkout".to_string(),
            repo_url: "https://git.local/checkout.git".to_string(),
            build_template_ids: vec![10],
            deployment_template_ids: vec![20],
        }],
        environments: vec![Environment {
            id: ENV_ID,
            name: "staging".to_string(),
        }],
        build_templates: vec![BuildTemplate {
            id: 10,
            name: "go-svc".to_string(),
            language: "go".to_string(),
            pipeline: "pipeline { agent any; stages { stage('build') { steps { sh 'make' } } } }"
                .to_string(),
        }],
        deployment_templates: vec![DeploymentTemplate {
            id: 20,
            name: "web".to_string(),
            content: deployment_template.to_string(),
        }],
        clusters: vec![ClusterCredential {
            id: CLUSTER_ID,
            name: "staging".to_string(),
            api_server: "https://10.0.0.1:6443".to_string(),
            ca_cert: String::new(),
            client_cert: String::new(),
            client_key: String::new(),
            token: "token".to_string(),
            skip_verify: true,
            enabled: true,
        }],
    }
}

pub fn fast_settings() -> PipelineSettings {
    PipelineSettings {
        queue_poll_interval: Duration::from_millis(2),
        build_number_timeout: Duration::from_millis(150),
        build_status_poll_interval: Duration::from_millis(2),
        build_completion_timeout: Duration::from_millis(500),
        field_manager: "conveyor-test".to_string(),
        task_log_dir: None,
    }
}

pub fn request() -> NewDeployTask {
    NewDeployTask {
        project_id: PROJECT_ID,
        env_id: ENV_ID,
        cluster_id: CLUSTER_ID,
        namespace: "shop".to_string(),
        git_ref: None,
        build_job_name: "go-svc".to_string(),
        registry_project: "library".to_string(),
        image_name: "checkout".to_string(),
        deployment_name: None,
    }
}

pub struct Harness {
    pub store: Arc<RecordingStore>,
    pub catalog: Arc<MemoryStore>,
    pub build_server: Arc<FakeBuildServer>,
    pub registry: Arc<FakeRegistry>,
    pub cluster: Arc<FakeCluster>,
    pub connector: Arc<FakeConnector>,
    pub runner: TaskRunner,
}

impl Harness {
    pub fn new(build_server: FakeBuildServer, deployment_template: &str) -> Self {
        Self::with_settings(build_server, deployment_template, fast_settings())
    }

    pub fn with_settings(
        build_server: FakeBuildServer,
        deployment_template: &str,
        settings: PipelineSettings,
    ) -> Self {
        let store = Arc::new(RecordingStore::default());
        let catalog = Arc::new(MemoryStore::with_catalog(catalog(deployment_template)));
        let build_server = Arc::new(build_server);
        let registry = Arc::new(FakeRegistry::default());
        let cluster = Arc::new(FakeCluster::default());
        let connector = Arc::new(FakeConnector {
            cluster: cluster.clone(),
            connects: AtomicU32::new(0),
        });

        let pipeline = Pipeline::new(
            store.clone(),
            catalog.clone(),
            build_server.clone(),
            registry.clone(),
            connector.clone(),
            settings,
        );

        Self {
            store,
            catalog,
            build_server,
            registry,
            cluster,
            connector,
            runner: TaskRunner::new(Arc::new(pipeline)),
        }
    }

    /// Persist a PENDING task without starting it
    pub async fn submit(&self) -> DeployTask {
        self.runner.submit(request()).await.unwrap()
    }

    /// Persist a task whose image the registry already lists
    pub async fn submit_published(&self) -> DeployTask {
        let task = self.submit().await;
        self.registry.publish(&task.image_tag);
        task
    }

    pub async fn task(&self, id: TaskId) -> DeployTask {
        self.store.get(id).await.unwrap()
    }
}
