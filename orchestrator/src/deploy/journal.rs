//! Per-task run log

use chrono::{SecondsFormat, Utc};
use tracing::warn;

use conveyor_models::TaskId;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Log file of one task
///
/// The path depends only on the task id, so concurrent runs of the same task
/// agree on it. Write failures are logged and never fail the run.
#[derive(Debug, Clone)]
pub struct TaskJournal {
    task_id: TaskId,
    file: Option<File>,
}

impl TaskJournal {
    pub fn file_name(task_id: TaskId) -> String {
        format!("deploy_task_{}.log", task_id)
    }

    /// Journal under `dir`, or a disabled one when no directory is configured
    pub fn open(dir: Option<&Dir>, task_id: TaskId) -> Self {
        Self {
            task_id,
            file: dir.map(|d| d.file(&Self::file_name(task_id))),
        }
    }

    /// Path persisted on the task, empty when disabled
    pub fn path_string(&self) -> String {
        self.file
            .as_ref()
            .map(|f| f.path().display().to_string())
            .unwrap_or_default()
    }

    pub async fn log(&self, message: impl AsRef<str>) {
        let Some(file) = &self.file else {
            return;
        };
        let line = format!(
            "[{}] Task {}: {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            self.task_id,
            message.as_ref()
        );
        if let Err(e) = file.append_line(&line).await {
            warn!("Failed to write task log {}: {}", file.path().display(), e);
        }
    }
}
