//! In-memory store
//!
//! Implements both [`TaskStore`] and [`Catalog`] with lock-protected maps.
//! State lives only as long as the process.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use conveyor_models::{
    BuildTemplate, ClusterCredential, DeployTask, DeploymentTemplate, Environment, Project,
    TaskId, TaskStatus, TaskUpdate,
};

use super::{CasResult, Catalog, CatalogData, TaskStore};
use crate::errors::ConveyorError;

fn poison_err<T>(_: PoisonError<T>) -> ConveyorError {
    ConveyorError::StorageError("lock poisoned".to_string())
}

/// In-memory task store and catalog
#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: RwLock<BTreeMap<TaskId, DeployTask>>,
    catalog: RwLock<CatalogData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store serving the given reference data
    pub fn with_catalog(catalog: CatalogData) -> Self {
        Self {
            tasks: RwLock::new(BTreeMap::new()),
            catalog: RwLock::new(catalog),
        }
    }

    /// Replace the reference data
    pub fn set_catalog(&self, catalog: CatalogData) -> Result<(), ConveyorError> {
        *self.catalog.write().map_err(poison_err)? = catalog;
        Ok(())
    }

    /// Number of stored tasks
    pub fn len(&self) -> Result<usize, ConveyorError> {
        Ok(self.tasks.read().map_err(poison_err)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, ConveyorError> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert(&self, mut task: DeployTask) -> Result<DeployTask, ConveyorError> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let next_id = tasks.keys().next_back().map(|id| id + 1).unwrap_or(1);
        task.id = next_id;
        tasks.insert(next_id, task.clone());
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<DeployTask, ConveyorError> {
        self.tasks
            .read()
            .map_err(poison_err)?
            .get(&id)
            .cloned()
            .ok_or_else(|| ConveyorError::NotFound(format!("task {}", id)))
    }

    async fn update_fields(&self, id: TaskId, update: &TaskUpdate) -> Result<(), ConveyorError> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| ConveyorError::NotFound(format!("task {}", id)))?;
        update.apply_to(task, Utc::now());
        Ok(())
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        update: &TaskUpdate,
    ) -> Result<CasResult, ConveyorError> {
        let mut tasks = self.tasks.write().map_err(poison_err)?;
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(CasResult::NotFound);
        };
        if task.status != expected {
            return Ok(CasResult::StatusMismatch {
                actual: task.status,
            });
        }
        update.apply_to(task, Utc::now());
        Ok(CasResult::Success)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<DeployTask>, ConveyorError> {
        Ok(self
            .tasks
            .read()
            .map_err(poison_err)?
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn project(&self, id: u64) -> Result<Option<Project>, ConveyorError> {
        Ok(self.catalog.read().map_err(poison_err)?.project(id).cloned())
    }

    async fn environment(&self, id: u64) -> Result<Option<Environment>, ConveyorError> {
        Ok(self.catalog.read().map_err(poison_err)?.environment(id).cloned())
    }

    async fn build_template_for_project(
        &self,
        project_id: u64,
    ) -> Result<Option<BuildTemplate>, ConveyorError> {
        Ok(self
            .catalog
            .read()
            .map_err(poison_err)?
            .build_template_for_project(project_id)
            .cloned())
    }

    async fn deployment_template_for_project(
        &self,
        project_id: u64,
    ) -> Result<Option<DeploymentTemplate>, ConveyorError> {
        Ok(self
            .catalog
            .read()
            .map_err(poison_err)?
            .deployment_template_for_project(project_id)
            .cloned())
    }

    async fn cluster_credential(&self, id: u64) -> Result<Option<ClusterCredential>, ConveyorError> {
        Ok(self.catalog.read().map_err(poison_err)?.cluster(id).cloned())
    }
}
