//! Error types for Conveyor

use thiserror::Error;

/// Main error type for Conveyor
#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yml::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Kubernetes error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Build server error: {0}")]
    BuildServerError(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Cluster error: {0}")]
    ClusterError(String),

    #[error("Template error: {0}")]
    TemplateError(String),

    #[error("Manifest error: {0}")]
    ManifestError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
