//! Deployment task records

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task identifier assigned by the store on insert
pub type TaskId = u64;

/// Pipeline status of a deployment task
///
/// The variants are declared in pipeline order; `rank` exposes that order so
/// callers can check that observed transitions never move backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Building,
    Pushing,
    Deploying,
    Success,
    Failed,
}

impl TaskStatus {
    /// Position in the pipeline order. Both terminal states share the last rank.
    pub fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Building => 1,
            TaskStatus::Pushing => 2,
            TaskStatus::Deploying => 3,
            TaskStatus::Success | TaskStatus::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Building => "BUILDING",
            TaskStatus::Pushing => "PUSHING",
            TaskStatus::Deploying => "DEPLOYING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end attempt to build, verify and deploy a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployTask {
    pub id: TaskId,
    pub project_id: u64,
    pub env_id: u64,
    pub cluster_id: u64,
    pub namespace: String,

    /// Branch or tag to build
    pub git_ref: String,

    /// Generated once at creation, never mutated afterwards
    pub image_tag: String,

    pub status: TaskStatus,

    /// Latest human readable stage message
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub log_path: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    // Denormalized at creation
    pub build_job_name: String,
    pub registry_project: String,
    pub image_name: String,
    pub deployment_name: String,
}

/// Request to create a deployment task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDeployTask {
    pub project_id: u64,
    pub env_id: u64,
    pub cluster_id: u64,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub git_ref: Option<String>,

    pub build_job_name: String,
    pub registry_project: String,
    pub image_name: String,

    #[serde(default)]
    pub deployment_name: Option<String>,
}

/// Partial update of a task; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    /// Status change with its stage message
    pub fn status(status: TaskStatus, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_log_path(mut self, log_path: impl Into<String>) -> Self {
        self.log_path = Some(log_path.into());
        self
    }

    pub fn with_started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn with_finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    /// Apply the update onto a task record
    ///
    /// The image tag is not part of the update surface.
    pub fn apply_to(&self, task: &mut DeployTask, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(message) = &self.message {
            task.message = message.clone();
        }
        if let Some(log_path) = &self.log_path {
            task.log_path = log_path.clone();
        }
        if let Some(started_at) = self.started_at {
            task.started_at = Some(started_at);
        }
        if let Some(finished_at) = self.finished_at {
            task.finished_at = Some(finished_at);
        }
        task.updated_at = now;
    }
}
