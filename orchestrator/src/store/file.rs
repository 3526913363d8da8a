//! JSON file store
//!
//! Each task is one `task-<id>.json` record written atomically. Reference
//! data is read from a catalog file on every lookup so edits are picked up
//! without a restart. Writes go through one async mutex, which makes
//! `transition` atomic for every writer in this process.

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;

use conveyor_models::{
    BuildTemplate, ClusterCredential, DeployTask, DeploymentTemplate, Environment, Project,
    TaskId, TaskStatus, TaskUpdate,
};

use super::{CasResult, Catalog, CatalogData, TaskStore};
use crate::errors::ConveyorError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

const TASK_PREFIX: &str = "task-";
const TASK_SUFFIX: &str = ".json";

/// File backed task store and catalog
pub struct FileStore {
    tasks_dir: Dir,
    catalog_file: File,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(tasks_dir: Dir, catalog_file: File) -> Self {
        Self {
            tasks_dir,
            catalog_file,
            write_lock: Mutex::new(()),
        }
    }

    fn task_file(&self, id: TaskId) -> File {
        self.tasks_dir
            .file(&format!("{}{}{}", TASK_PREFIX, id, TASK_SUFFIX))
    }

    async fn read_task(&self, id: TaskId) -> Result<Option<DeployTask>, ConveyorError> {
        let file = self.task_file(id);
        if !file.exists().await {
            return Ok(None);
        }
        Ok(Some(file.read_json().await?))
    }

    async fn task_ids(&self) -> Result<Vec<TaskId>, ConveyorError> {
        if !self.tasks_dir.exists().await {
            return Ok(Vec::new());
        }

        let mut ids: Vec<TaskId> = self
            .tasks_dir
            .list_files()
            .await?
            .iter()
            .filter_map(|path| path.file_name()?.to_str().and_then(parse_task_file_name))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn catalog(&self) -> Result<CatalogData, ConveyorError> {
        if !self.catalog_file.exists().await {
            return Ok(CatalogData::default());
        }
        self.catalog_file.read_json().await
    }
}

fn parse_task_file_name(name: &str) -> Option<TaskId> {
    name.strip_prefix(TASK_PREFIX)?
        .strip_suffix(TASK_SUFFIX)?
        .parse()
        .ok()
}

#[async_trait]
impl TaskStore for FileStore {
    async fn insert(&self, mut task: DeployTask) -> Result<DeployTask, ConveyorError> {
        let _guard = self.write_lock.lock().await;
        self.tasks_dir.create().await?;

        let next_id = self.task_ids().await?.last().map(|id| id + 1).unwrap_or(1);
        task.id = next_id;
        self.task_file(next_id).write_json_atomic(&task).await?;
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<DeployTask, ConveyorError> {
        self.read_task(id)
            .await?
            .ok_or_else(|| ConveyorError::NotFound(format!("task {}", id)))
    }

    async fn update_fields(&self, id: TaskId, update: &TaskUpdate) -> Result<(), ConveyorError> {
        let _guard = self.write_lock.lock().await;
        let mut task = self.get(id).await?;
        update.apply_to(&mut task, Utc::now());
        self.task_file(id).write_json_atomic(&task).await
    }

    async fn transition(
        &self,
        id: TaskId,
        expected: TaskStatus,
        update: &TaskUpdate,
    ) -> Result<CasResult, ConveyorError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut task) = self.read_task(id).await? else {
            return Ok(CasResult::NotFound);
        };
        if task.status != expected {
            return Ok(CasResult::StatusMismatch {
                actual: task.status,
            });
        }
        update.apply_to(&mut task, Utc::now());
        self.task_file(id).write_json_atomic(&task).await?;
        Ok(CasResult::Success)
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<DeployTask>, ConveyorError> {
        let mut tasks = Vec::new();
        for id in self.task_ids().await? {
            match self.read_task(id).await {
                Ok(Some(task)) if task.status == status => tasks.push(task),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable task record {}: {}", id, e),
            }
        }
        Ok(tasks)
    }
}

#[async_trait]
impl Catalog for FileStore {
    async fn project(&self, id: u64) -> Result<Option<Project>, ConveyorError> {
        Ok(self.catalog().await?.project(id).cloned())
    }

    async fn environment(&self, id: u64) -> Result<Option<Environment>, ConveyorError> {
        Ok(self.catalog().await?.environment(id).cloned())
    }

    async fn build_template_for_project(
        &self,
        project_id: u64,
    ) -> Result<Option<BuildTemplate>, ConveyorError> {
        Ok(self
            .catalog()
            .await?
            .build_template_for_project(project_id)
            .cloned())
    }

    async fn deployment_template_for_project(
        &self,
        project_id: u64,
    ) -> Result<Option<DeploymentTemplate>, ConveyorError> {
        Ok(self
            .catalog()
            .await?
            .deployment_template_for_project(project_id)
            .cloned())
    }

    async fn cluster_credential(&self, id: u64) -> Result<Option<ClusterCredential>, ConveyorError> {
        Ok(self.catalog().await?.cluster(id).cloned())
    }
}
