//! Cluster client abstraction
//!
//! The engine talks to a cluster only through [`ClusterClient`]: namespace
//! get-or-create plus server-side apply of the three typed resources it
//! models. A fresh client is built per task from stored credentials.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};

use conveyor_models::ClusterCredential;

use crate::errors::ConveyorError;

/// Server-side apply parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    pub field_manager: String,
    pub force_conflicts: bool,
}

impl ApplyOptions {
    pub fn forced(field_manager: impl Into<String>) -> Self {
        Self {
            field_manager: field_manager.into(),
            force_conflicts: true,
        }
    }
}

/// Outcome of a namespace get-or-create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceOutcome {
    Existing,
    Created,
}

/// Authenticated handle to one cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get or create; a concurrent "already exists" counts as success
    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceOutcome, ConveyorError>;

    async fn apply_config_map(
        &self,
        config_map: &ConfigMap,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError>;

    async fn apply_service(
        &self,
        service: &Service,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError>;

    async fn apply_deployment(
        &self,
        deployment: &Deployment,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError>;
}

/// Builds cluster handles from stored credentials
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn connect(
        &self,
        credential: &ClusterCredential,
    ) -> Result<Arc<dyn ClusterClient>, ConveyorError>;
}
