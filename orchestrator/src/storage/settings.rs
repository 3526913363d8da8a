//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deploy::pipeline::PipelineSettings;
use crate::logs::LogLevel;

/// Service settings
#[derive(Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON formatted logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Build server configuration
    #[serde(default)]
    pub jenkins: JenkinsSettings,

    /// Image registry configuration
    #[serde(default)]
    pub harbor: HarborSettings,

    /// Recovery sweep period in seconds
    #[serde(default = "default_worker_period")]
    pub worker_period_secs: u64,

    /// Enable the recovery worker
    #[serde(default = "default_true")]
    pub enable_recovery_worker: bool,

    /// Write one log file per task run
    #[serde(default = "default_true")]
    pub enable_task_logs: bool,

    /// Poll intervals and wait bounds
    #[serde(default)]
    pub pipeline: PipelineTimings,
}

fn default_true() -> bool {
    true
}

fn default_worker_period() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            jenkins: JenkinsSettings::default(),
            harbor: HarborSettings::default(),
            worker_period_secs: default_worker_period(),
            enable_recovery_worker: true,
            enable_task_logs: true,
            pipeline: PipelineTimings::default(),
        }
    }
}

impl Settings {
    pub fn worker_period(&self) -> Duration {
        Duration::from_secs(self.worker_period_secs)
    }
}

/// Build server settings
#[derive(Clone, Serialize, Deserialize)]
pub struct JenkinsSettings {
    #[serde(default = "default_jenkins_url")]
    pub url: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,
}

fn default_jenkins_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for JenkinsSettings {
    fn default() -> Self {
        Self {
            url: default_jenkins_url(),
            user: String::new(),
            password: String::new(),
        }
    }
}

/// Registry settings
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct HarborSettings {
    #[serde(default)]
    pub url: String,

    /// Optional basic auth user
    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,
}

/// Pipeline timings in seconds, as written in the settings file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineTimings {
    #[serde(default = "default_queue_poll_interval")]
    pub queue_poll_interval_secs: u64,

    #[serde(default = "default_build_number_timeout")]
    pub build_number_timeout_secs: u64,

    #[serde(default = "default_build_status_poll_interval")]
    pub build_status_poll_interval_secs: u64,

    #[serde(default = "default_build_completion_timeout")]
    pub build_completion_timeout_secs: u64,

    #[serde(default = "default_field_manager")]
    pub field_manager: String,
}

fn default_queue_poll_interval() -> u64 {
    5
}

fn default_build_number_timeout() -> u64 {
    120
}

fn default_build_status_poll_interval() -> u64 {
    10
}

fn default_build_completion_timeout() -> u64 {
    600
}

fn default_field_manager() -> String {
    "conveyor-controller".to_string()
}

impl Default for PipelineTimings {
    fn default() -> Self {
        Self {
            queue_poll_interval_secs: default_queue_poll_interval(),
            build_number_timeout_secs: default_build_number_timeout(),
            build_status_poll_interval_secs: default_build_status_poll_interval(),
            build_completion_timeout_secs: default_build_completion_timeout(),
            field_manager: default_field_manager(),
        }
    }
}

impl PipelineTimings {
    /// Convert into engine settings; the task log directory is supplied by the caller
    pub fn to_pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            queue_poll_interval: Duration::from_secs(self.queue_poll_interval_secs),
            build_number_timeout: Duration::from_secs(self.build_number_timeout_secs),
            build_status_poll_interval: Duration::from_secs(self.build_status_poll_interval_secs),
            build_completion_timeout: Duration::from_secs(self.build_completion_timeout_secs),
            field_manager: self.field_manager.clone(),
            task_log_dir: None,
        }
    }
}
