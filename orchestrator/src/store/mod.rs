//! Pluggable persistence for deployment tasks and reference data.
//!
//! The task engine only changes a task's status through
//! [`TaskStore::transition`], a compare-and-swap on the current status. Two
//! runs racing for the same task therefore cannot both leave PENDING.

pub mod file;
pub mod memory;

use async_trait::async_trait;

use conveyor_models::{
    BuildTemplate, ClusterCredential, DeployTask, DeploymentTemplate, Environment, Project,
    TaskId, TaskStatus, TaskUpdate,
};

use crate::errors::ConveyorError;

/// Result of a compare-and-swap status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The update was applied
    Success,
    /// No task with that id
    NotFound,
    /// The stored status differs from the expected one
    StatusMismatch { actual: TaskStatus },
}

impl CasResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CasResult::Success)
    }
}

/// Durable store for task records
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task; the store assigns the id
    async fn insert(&self, task: DeployTask) -> Result<DeployTask, ConveyorError>;

    /// Fetch a task, `ConveyorError::NotFound` if absent
    async fn get(&self, id: TaskId) -> Result<DeployTask, ConveyorError>;

    /// Unconditional field update
    async fn update_fields(&self, id: TaskId, update: &TaskUpdate) -> Result<(), ConveyorError>;

    /// Apply `update` only if the stored status equals `expected`
    async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        update: &TaskUpdate,
    ) -> Result<CasResult, ConveyorError>;

    /// All tasks currently in `status`, ordered by id
    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<DeployTask>, ConveyorError>;
}

/// Read-only reference data
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn project(&self, id: u64) -> Result<Option<Project>, ConveyorError>;

    async fn environment(&self, id: u64) -> Result<Option<Environment>, ConveyorError>;

    async fn build_template_for_project(
        &self,
        project_id: u64,
    ) -> Result<Option<BuildTemplate>, ConveyorError>;

    async fn deployment_template_for_project(
        &self,
        project_id: u64,
    ) -> Result<Option<DeploymentTemplate>, ConveyorError>;

    async fn cluster_credential(&self, id: u64) -> Result<Option<ClusterCredential>, ConveyorError>;
}

/// Serializable catalog contents, shared by the in-memory and file stores
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CatalogData {
    #[serde(default)]
    pub projects: Vec<Project>,

    #[serde(default)]
    pub environments: Vec<Environment>,

    #[serde(default)]
    pub build_templates: Vec<BuildTemplate>,

    #[serde(default)]
    pub deployment_templates: Vec<DeploymentTemplate>,

    #[serde(default)]
    pub clusters: Vec<ClusterCredential>,
}

impl CatalogData {
    pub fn project(&self, id: u64) -> Option<&Project> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn environment(&self, id: u64) -> Option<&Environment> {
        self.environments.iter().find(|e| e.id == id)
    }

    /// First build template linked to the project that still exists
    pub fn build_template_for_project(&self, project_id: u64) -> Option<&BuildTemplate> {
        let project = self.project(project_id)?;
        project
            .build_template_ids
            .iter()
            .find_map(|id| self.build_templates.iter().find(|t| t.id == *id))
    }

    /// First deployment template linked to the project that still exists
    pub fn deployment_template_for_project(&self, project_id: u64) -> Option<&DeploymentTemplate> {
        let project = self.project(project_id)?;
        project
            .deployment_template_ids
            .iter()
            .find_map(|id| self.deployment_templates.iter().find(|t| t.id == *id))
    }

    pub fn cluster(&self, id: u64) -> Option<&ClusterCredential> {
        self.clusters.iter().find(|c| c.id == id)
    }
}
