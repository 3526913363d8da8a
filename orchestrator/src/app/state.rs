//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use conveyor_models::TaskStatus;

use crate::app::options::AppOptions;
use crate::ci::harbor::HarborClient;
use crate::ci::jenkins::JenkinsClient;
use crate::ci::kubernetes::KubeConnector;
use crate::deploy::pipeline::Pipeline;
use crate::deploy::runner::TaskRunner;
use crate::errors::ConveyorError;
use crate::http::client::BasicAuth;
use crate::store::file::FileStore;

/// Main application state
pub struct AppState {
    /// Spawns pipeline runs
    pub runner: TaskRunner,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, ConveyorError> {
        info!("Initializing application state...");

        let layout = &options.layout;
        layout.setup().await?;

        let store = Arc::new(FileStore::new(layout.tasks_dir(), layout.catalog_file()));

        let jenkins = JenkinsClient::new(
            &options.jenkins.url,
            BasicAuth::from_parts(&options.jenkins.user, &options.jenkins.password),
        )?;
        let harbor = HarborClient::new(
            &options.harbor.url,
            BasicAuth::from_parts(&options.harbor.user, &options.harbor.password),
        )?;

        let mut settings = options.pipeline.clone();
        if options.enable_task_logs && settings.task_log_dir.is_none() {
            settings.task_log_dir = Some(layout.task_logs_dir());
        }

        let pipeline = Pipeline::new(
            store.clone(),
            store,
            Arc::new(jenkins),
            Arc::new(harbor),
            Arc::new(KubeConnector),
            settings,
        );
        let runner = TaskRunner::new(Arc::new(pipeline));

        Ok(Self { runner })
    }

    /// Number of tasks between PENDING and a terminal status
    pub async fn in_flight(&self) -> Result<usize, ConveyorError> {
        let store = self.runner.pipeline().store();
        let mut count = 0;
        for status in [
            TaskStatus::Building,
            TaskStatus::Pushing,
            TaskStatus::Deploying,
        ] {
            count += store.list_by_status(status).await?.len();
        }
        Ok(count)
    }

    /// Shutdown application state
    ///
    /// Runs in flight are detached and left to finish on their own.
    pub async fn shutdown(&self) -> Result<(), ConveyorError> {
        info!("Shutting down application state...");
        let in_flight = self.in_flight().await?;
        if in_flight > 0 {
            warn!(
                "{} tasks still mid-pipeline, their runs are left detached",
                in_flight
            );
        }
        Ok(())
    }
}
