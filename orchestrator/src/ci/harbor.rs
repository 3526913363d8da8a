//! Image registry client

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use tracing::debug;

use crate::errors::ConveyorError;
use crate::http::client::{BasicAuth, HttpClient};

/// Network timeout for registry calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// External image registry
#[async_trait]
pub trait Registry: Send + Sync {
    /// Every tag currently attached to `project/image`
    async fn list_tags(&self, project: &str, image: &str) -> Result<Vec<String>, ConveyorError>;
}

/// Harbor v2 API client
pub struct HarborClient {
    http: HttpClient,
}

impl HarborClient {
    pub fn new(base_url: &str, auth: Option<BasicAuth>) -> Result<Self, ConveyorError> {
        Ok(Self {
            http: HttpClient::new(base_url, REQUEST_TIMEOUT, auth, ConveyorError::RegistryError)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Artifact {
    #[serde(default)]
    tags: Option<Vec<ArtifactTag>>,
}

#[derive(Debug, Deserialize)]
struct ArtifactTag {
    name: String,
}

/// Harbor expects nested repository names with the slash encoded twice
pub fn encode_repository_name(image: &str) -> String {
    image.replace('/', "%2F")
}

#[async_trait]
impl Registry for HarborClient {
    async fn list_tags(&self, project: &str, image: &str) -> Result<Vec<String>, ConveyorError> {
        let repository = encode_repository_name(image);
        let request = self
            .http
            .request_segments(
                Method::GET,
                &[
                    "api",
                    "v2.0",
                    "projects",
                    project,
                    "repositories",
                    &repository,
                    "artifacts",
                ],
            )?
            .query(&[("with_tag", "true"), ("page_size", "100")]);
        let artifacts: Vec<Artifact> = self.http.send(request).await?.json().await?;

        let tags: Vec<String> = flatten_tags(artifacts);
        debug!("Registry lists {} tags for {}/{}", tags.len(), project, image);
        Ok(tags)
    }
}

fn flatten_tags(artifacts: Vec<Artifact>) -> Vec<String> {
    artifacts
        .into_iter()
        .flat_map(|a| a.tags.unwrap_or_default())
        .map(|t| t.name)
        .collect()
}
