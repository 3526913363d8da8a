//! Application configuration options

use std::fmt;
use std::time::Duration;

use crate::deploy::pipeline::PipelineSettings;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::recovery;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Build server connection
    pub jenkins: ClientOptions,

    /// Image registry connection
    pub harbor: ClientOptions,

    /// Poll intervals and wait bounds of every run
    pub pipeline: PipelineSettings,

    /// Write one log file per task run
    pub enable_task_logs: bool,

    /// Enable the recovery worker
    pub enable_recovery_worker: bool,

    /// Recovery worker options
    pub recovery_worker: recovery::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            jenkins: ClientOptions::new("http://localhost:8080"),
            harbor: ClientOptions::new("http://localhost"),
            pipeline: PipelineSettings::default(),
            enable_task_logs: true,
            enable_recovery_worker: true,
            recovery_worker: recovery::Options::default(),
        }
    }
}

impl AppOptions {
    /// Options from a settings file rooted at `layout`
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        Self {
            layout,
            jenkins: ClientOptions {
                url: settings.jenkins.url.clone(),
                user: settings.jenkins.user.clone(),
                password: settings.jenkins.password.clone(),
            },
            harbor: ClientOptions {
                url: settings.harbor.url.clone(),
                user: settings.harbor.user.clone(),
                password: settings.harbor.password.clone(),
            },
            pipeline: settings.pipeline.to_pipeline_settings(),
            enable_task_logs: settings.enable_task_logs,
            enable_recovery_worker: settings.enable_recovery_worker,
            recovery_worker: recovery::Options {
                interval: settings.worker_period(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Lifecycle options for the service
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Connection options of an external HTTP service
#[derive(Clone)]
pub struct ClientOptions {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user: String::new(),
            password: String::new(),
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .finish()
    }
}
