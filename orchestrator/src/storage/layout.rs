//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::ConveyorError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the service
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Read-only reference data (projects, templates, clusters)
    pub fn catalog_file(&self) -> File {
        File::new(self.base_dir.join("catalog.json"))
    }

    /// One JSON record per deployment task
    pub fn tasks_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("tasks"))
    }

    /// Get the service logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Per-task run logs
    pub fn task_logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs").join("tasks"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), ConveyorError> {
        self.tasks_dir().create().await?;
        self.logs_dir().create().await?;
        self.task_logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/conveyor");

        #[cfg(not(target_os = "linux"))]
        let base_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".conveyor");

        Self::new(base_dir)
    }
}

#[cfg(not(target_os = "linux"))]
mod dirs {
    use std::path::PathBuf;

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
    }
}
