//! Read-only reference records consumed by the task engine

use serde::{Deserialize, Serialize};

/// Project (source repository) record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: u64,

    /// Short machine name, substituted for `{{PROJECT_NAME}}`
    #[serde(default)]
    pub name: String,

    pub repo_url: String,

    /// Build templates linked to this project; the first one is used
    #[serde(default)]
    pub build_template_ids: Vec<u64>,

    /// Deployment templates linked to this project; the first one is used
    #[serde(default)]
    pub deployment_template_ids: Vec<u64>,
}

/// Target environment record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub id: u64,

    #[serde(default)]
    pub name: String,
}

/// Build template: a pipeline definition materialized into a build job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildTemplate {
    pub id: u64,
    pub name: String,

    #[serde(default)]
    pub language: String,

    /// Pipeline script body
    pub pipeline: String,
}

/// Deployment template: multi-document YAML with placeholder tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTemplate {
    pub id: u64,
    pub name: String,
    pub content: String,
}

/// Credentials for one container-orchestration cluster
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCredential {
    pub id: u64,

    #[serde(default)]
    pub name: String,

    pub api_server: String,

    /// PEM encoded CA bundle
    #[serde(default)]
    pub ca_cert: String,

    /// PEM encoded client certificate
    #[serde(default)]
    pub client_cert: String,

    /// PEM encoded client key
    #[serde(default)]
    pub client_key: String,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub skip_verify: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl std::fmt::Debug for ClusterCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCredential")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("api_server", &self.api_server)
            .field("has_token", &!self.token.is_empty())
            .field("has_client_cert", &!self.client_cert.is_empty())
            .field("skip_verify", &self.skip_verify)
            .field("enabled", &self.enabled)
            .finish()
    }
}
