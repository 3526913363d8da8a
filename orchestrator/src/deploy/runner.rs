//! Task creation and run spawning

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use conveyor_models::{DeployTask, NewDeployTask, TaskId, TaskStatus};

use crate::deploy::pipeline::{DriveOutcome, Pipeline};
use crate::errors::ConveyorError;

/// Handle of one spawned pipeline run
pub type RunHandle = JoinHandle<Result<DriveOutcome, ConveyorError>>;

pub const DEFAULT_GIT_REF: &str = "main";

/// Image tag format, one tag per second of creation time
pub const IMAGE_TAG_FORMAT: &str = "%Y%m%d%H%M%S";

fn require_id(value: u64, field: &str) -> Result<(), ConveyorError> {
    if value == 0 {
        return Err(ConveyorError::ValidationError(format!("{} is required", field)));
    }
    Ok(())
}

fn require_text(value: &str, field: &str) -> Result<String, ConveyorError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConveyorError::ValidationError(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

/// Validate a creation request and build the PENDING record
///
/// The id is left at zero for the store to assign.
pub fn prepare_task(new: NewDeployTask, now: DateTime<Utc>) -> Result<DeployTask, ConveyorError> {
    require_id(new.project_id, "project_id")?;
    require_id(new.env_id, "env_id")?;
    require_id(new.cluster_id, "cluster_id")?;
    let build_job_name = require_text(&new.build_job_name, "build_job_name")?;
    let registry_project = require_text(&new.registry_project, "registry_project")?;
    let image_name = require_text(&new.image_name, "image_name")?;

    let git_ref = new
        .git_ref
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_GIT_REF.to_string());
    let deployment_name = new
        .deployment_name
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| format!("app-{}", new.project_id));

    Ok(DeployTask {
        id: 0,
        project_id: new.project_id,
        env_id: new.env_id,
        cluster_id: new.cluster_id,
        namespace: new.namespace.trim().to_string(),
        git_ref,
        image_tag: now.format(IMAGE_TAG_FORMAT).to_string(),
        status: TaskStatus::Pending,
        message: String::new(),
        log_path: String::new(),
        created_at: now,
        updated_at: now,
        started_at: None,
        finished_at: None,
        build_job_name,
        registry_project,
        image_name,
        deployment_name,
    })
}

/// Spawns pipeline runs as independent tokio tasks
///
/// Runs are never cancelled by the runner; callers may abort a handle.
#[derive(Clone)]
pub struct TaskRunner {
    pipeline: Arc<Pipeline>,
}

impl TaskRunner {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Persist a new PENDING task without starting it
    pub async fn submit(&self, new: NewDeployTask) -> Result<DeployTask, ConveyorError> {
        let task = prepare_task(new, Utc::now())?;
        let task = self.pipeline.store().insert(task).await?;
        info!(
            "Created task {} for project {} (image tag {})",
            task.id, task.project_id, task.image_tag
        );
        Ok(task)
    }

    /// Persist a new task and start its run
    pub async fn create_task(
        &self,
        new: NewDeployTask,
    ) -> Result<(DeployTask, RunHandle), ConveyorError> {
        let task = self.submit(new).await?;
        let handle = self.spawn(task.id);
        Ok((task, handle))
    }

    /// Start one run for a task
    pub fn spawn(&self, task_id: TaskId) -> RunHandle {
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let result = pipeline.drive(task_id).await;
            if let Err(e) = &result {
                error!("Run of task {} aborted: {}", task_id, e);
            }
            result
        })
    }

    /// Start one run per task currently PENDING
    pub async fn sweep(&self) -> Result<Vec<RunHandle>, ConveyorError> {
        let pending = self
            .pipeline
            .store()
            .list_by_status(TaskStatus::Pending)
            .await?;
        if !pending.is_empty() {
            info!("Recovering {} pending tasks", pending.len());
        }
        Ok(pending.iter().map(|task| self.spawn(task.id)).collect())
    }
}
