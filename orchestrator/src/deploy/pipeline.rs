//! Deployment pipeline driver
//!
//! `Pipeline::drive` takes one PENDING task through build, push verification
//! and deploy. A run only starts if it wins the PENDING to BUILDING
//! compare-and-swap, and every later status change is a compare-and-swap
//! from the status this run wrote last. A run that loses one of those swaps
//! stops without touching the task again.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use conveyor_models::{DeployTask, TaskId, TaskStatus, TaskUpdate};

use crate::ci::cluster::{ApplyOptions, ClusterConnector};
use crate::ci::harbor::Registry;
use crate::ci::jenkins::{job_config_xml, BuildParameters, BuildServer, BuildStatus};
use crate::deploy::apply::{Dispatch, ManifestApplier};
use crate::deploy::fsm::{TaskEvent, TaskFsm};
use crate::deploy::journal::TaskJournal;
use crate::deploy::template::{render, split_documents, RenderContext};
use crate::errors::ConveyorError;
use crate::filesys::dir::Dir;
use crate::store::{CasResult, Catalog, TaskStore};

/// Every poll interval and wait bound of a run
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Queue to build number polling
    pub queue_poll_interval: Duration,
    pub build_number_timeout: Duration,

    /// Build completion polling
    pub build_status_poll_interval: Duration,
    pub build_completion_timeout: Duration,

    /// Field manager for server-side apply
    pub field_manager: String,

    /// Directory of per-task log files, disabled when `None`
    pub task_log_dir: Option<Dir>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_poll_interval: Duration::from_secs(5),
            build_number_timeout: Duration::from_secs(120),
            build_status_poll_interval: Duration::from_secs(10),
            build_completion_timeout: Duration::from_secs(600),
            field_manager: "conveyor-controller".to_string(),
            task_log_dir: None,
        }
    }
}

/// How a call to [`Pipeline::drive`] ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    /// The task was not PENDING (or vanished) so this call did nothing
    NotStarted { status: Option<TaskStatus> },

    /// The run reached a terminal status
    Finished { status: TaskStatus, message: String },

    /// Another writer changed the status mid-run
    Abandoned { status: Option<TaskStatus> },
}

enum StageError {
    Failed(ConveyorError),
    Lost(Option<TaskStatus>),
}

impl From<ConveyorError> for StageError {
    fn from(e: ConveyorError) -> Self {
        StageError::Failed(e)
    }
}

/// The task engine's pipeline
pub struct Pipeline {
    store: Arc<dyn TaskStore>,
    catalog: Arc<dyn Catalog>,
    build_server: Arc<dyn BuildServer>,
    registry: Arc<dyn Registry>,
    clusters: Arc<dyn ClusterConnector>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn TaskStore>,
        catalog: Arc<dyn Catalog>,
        build_server: Arc<dyn BuildServer>,
        registry: Arc<dyn Registry>,
        clusters: Arc<dyn ClusterConnector>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            build_server,
            registry,
            clusters,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Drive one task from PENDING to a terminal status
    ///
    /// Errors are returned only when the task cannot be read or the store
    /// fails; stage failures end as `Finished` with status FAILED.
    pub async fn drive(&self, task_id: TaskId) -> Result<DriveOutcome, ConveyorError> {
        let task = self.store.get(task_id).await?;
        if task.status != TaskStatus::Pending {
            debug!("Task {} is {}, not starting", task_id, task.status);
            return Ok(DriveOutcome::NotStarted {
                status: Some(task.status),
            });
        }

        let journal = TaskJournal::open(self.settings.task_log_dir.as_ref(), task_id);
        let mut fsm = TaskFsm::new();
        let building = fsm.process(TaskEvent::Start)?;
        let claim = TaskUpdate::status(building, "build started")
            .with_started_at(Utc::now())
            .with_log_path(journal.path_string());

        match self
            .store
            .transition(task_id, TaskStatus::Pending, &claim)
            .await?
        {
            CasResult::Success => {}
            CasResult::NotFound => return Ok(DriveOutcome::NotStarted { status: None }),
            CasResult::StatusMismatch { actual } => {
                debug!("Task {} already claimed ({})", task_id, actual);
                return Ok(DriveOutcome::NotStarted {
                    status: Some(actual),
                });
            }
        }
        info!("Task {}: {}", task_id, building);
        journal
            .log(format!("starting build for ref {}", task.git_ref))
            .await;

        match self.run_stages(&task, &mut fsm, &journal).await {
            Ok(()) => Ok(DriveOutcome::Finished {
                status: TaskStatus::Success,
                message: "deployment completed".to_string(),
            }),
            Err(StageError::Lost(status)) => {
                warn!(
                    "Task {} changed by another writer ({:?}), abandoning run",
                    task_id, status
                );
                journal.log("run abandoned, task changed elsewhere").await;
                Ok(DriveOutcome::Abandoned { status })
            }
            Err(StageError::Failed(e)) => {
                let message = e.to_string();
                error!("Task {} failed: {}", task_id, message);
                journal.log(format!("FAILED: {}", message)).await;
                match self
                    .advance(task_id, &mut fsm, TaskEvent::Fail(message.clone()), &message)
                    .await
                {
                    Ok(()) => Ok(DriveOutcome::Finished {
                        status: TaskStatus::Failed,
                        message,
                    }),
                    Err(StageError::Lost(status)) => Ok(DriveOutcome::Abandoned { status }),
                    Err(StageError::Failed(e)) => Err(e),
                }
            }
        }
    }

    async fn run_stages(
        &self,
        task: &DeployTask,
        fsm: &mut TaskFsm,
        journal: &TaskJournal,
    ) -> Result<(), StageError> {
        let number = self.build(task, journal).await?;
        journal
            .log(format!("build #{} finished, image={}", number, task.image_tag))
            .await;
        self.advance(
            task.id,
            fsm,
            TaskEvent::BuildSucceeded,
            "verifying image in registry",
        )
        .await?;

        self.verify_image(task).await?;
        journal.log("image present in registry").await;
        self.advance(task.id, fsm, TaskEvent::ImageVerified, "deploying to cluster")
            .await?;

        let dispatched = self.deploy(task).await?;
        journal
            .log(format!(
                "deploy SUCCESS, {} manifests dispatched",
                dispatched.len()
            ))
            .await;
        self.advance(task.id, fsm, TaskEvent::Deployed, "deployment completed")
            .await?;
        Ok(())
    }

    /// Persist the next status with a compare-and-swap from the current one
    ///
    /// `fsm` only moves once the store accepted the write, so it always
    /// holds the last persisted status.
    async fn advance(
        &self,
        task_id: TaskId,
        fsm: &mut TaskFsm,
        event: TaskEvent,
        message: &str,
    ) -> Result<(), StageError> {
        let from = fsm.state();
        let mut next = fsm.clone();
        let to = next.process(event)?;
        let mut update = TaskUpdate::status(to, message);
        if to.is_terminal() {
            update = update.with_finished_at(Utc::now());
        }

        match self.store.transition(task_id, from, &update).await? {
            CasResult::Success => {
                *fsm = next;
                info!("Task {}: {} - {}", task_id, to, message);
                Ok(())
            }
            CasResult::NotFound => Err(StageError::Lost(None)),
            CasResult::StatusMismatch { actual } => Err(StageError::Lost(Some(actual))),
        }
    }

    /// Build stage, returns the build number
    async fn build(&self, task: &DeployTask, journal: &TaskJournal) -> Result<u64, ConveyorError> {
        let project = self
            .catalog
            .project(task.project_id)
            .await?
            .ok_or_else(|| ConveyorError::NotFound(format!("project {}", task.project_id)))?;
        let template = self
            .catalog
            .build_template_for_project(task.project_id)
            .await?
            .ok_or_else(|| {
                ConveyorError::NotFound(format!(
                    "no build template for project {}",
                    task.project_id
                ))
            })?;

        let params = BuildParameters {
            target_branch: task.git_ref.clone(),
            repo_url: project.repo_url.clone(),
            image_tag: task.image_tag.clone(),
        };
        let job = task.build_job_name.as_str();

        if !self.build_server.job_exists(job).await? {
            info!("Build job {} does not exist, creating", job);
            journal.log(format!("creating build job {}", job)).await;
            self.build_server
                .create_job(job, &job_config_xml(&template, &params))
                .await?;
        }

        self.build_server.authenticate().await?;
        let queued = self.build_server.trigger_build(job, &params).await?;
        journal
            .log(format!("build queued with id {}", queued.queue_id))
            .await;

        let queue_id = queued.queue_id;
        let number = poll_until(
            self.settings.queue_poll_interval,
            self.settings.build_number_timeout,
            "build number assignment",
            || async move { self.build_server.poll_queue(queue_id).await },
        )
        .await?;
        info!("Task {}: build #{} of {} started", task.id, number, job);

        let status: BuildStatus = poll_until(
            self.settings.build_status_poll_interval,
            self.settings.build_completion_timeout,
            "build completion",
            || async move {
                let status = self.build_server.build_status(job, number).await?;
                Ok(status.is_complete().then_some(status))
            },
        )
        .await?;

        if !status.is_success() {
            return Err(ConveyorError::BuildServerError(format!(
                "build #{} of {} finished with result {}",
                number,
                job,
                status.result.as_deref().unwrap_or("UNKNOWN")
            )));
        }
        Ok(number)
    }

    /// Single point-in-time registry check
    async fn verify_image(&self, task: &DeployTask) -> Result<(), ConveyorError> {
        let tags = self
            .registry
            .list_tags(&task.registry_project, &task.image_name)
            .await
            .map_err(|e| {
                ConveyorError::RegistryError(format!("registry verification failed: {}", e))
            })?;

        if !tags.iter().any(|tag| tag == &task.image_tag) {
            return Err(ConveyorError::RegistryError(format!(
                "registry verification failed: tag {} not found in {}/{}",
                task.image_tag, task.registry_project, task.image_name
            )));
        }
        Ok(())
    }

    async fn deploy(&self, task: &DeployTask) -> Result<Vec<Dispatch>, ConveyorError> {
        let credential = self
            .catalog
            .cluster_credential(task.cluster_id)
            .await?
            .ok_or_else(|| ConveyorError::NotFound(format!("cluster {}", task.cluster_id)))?;
        let template = self
            .catalog
            .deployment_template_for_project(task.project_id)
            .await?
            .ok_or_else(|| {
                ConveyorError::NotFound(format!(
                    "no deployment template for project {}",
                    task.project_id
                ))
            })?;
        let project = self.catalog.project(task.project_id).await?;
        let environment = self.catalog.environment(task.env_id).await?;

        let ctx = RenderContext::for_task(task, project.as_ref(), environment.as_ref());
        let documents = split_documents(&render(&template.content, &ctx));
        debug!(
            "Task {}: template {} renders {} documents",
            task.id,
            template.name,
            documents.len()
        );

        let client = self.clusters.connect(&credential).await?;
        let applier = ManifestApplier::new(
            client.as_ref(),
            ApplyOptions::forced(self.settings.field_manager.clone()),
            task.image_tag.clone(),
            task.namespace.clone(),
        );
        applier.apply_documents(&documents).await
    }
}

/// Probe every `interval` until it yields a value or `timeout` elapses
///
/// Probe errors are logged and retried; only the timeout ends the wait early.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    what: &str,
    mut probe: F,
) -> Result<T, ConveyorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ConveyorError>>,
{
    let polling = async {
        loop {
            tokio::time::sleep(interval).await;
            match probe().await {
                Ok(Some(value)) => return value,
                Ok(None) => debug!("Still waiting for {}", what),
                Err(e) => warn!("Error while waiting for {}: {}", what, e),
            }
        }
    };

    tokio::time::timeout(timeout, polling).await.map_err(|_| {
        ConveyorError::Timeout(format!(
            "timed out waiting for {} (limit: {:?})",
            what, timeout
        ))
    })
}
