//! Build server client
//!
//! Jenkins compatible REST calls plus generation of the pipeline job
//! definition that a build template is materialized into.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::escape::escape;
use regex::Regex;
use reqwest::{header, Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use conveyor_models::BuildTemplate;

use crate::errors::ConveyorError;
use crate::http::client::{BasicAuth, HttpClient};

/// Network timeout for every build server call
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// String parameters passed to every build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildParameters {
    pub target_branch: String,
    pub repo_url: String,
    pub image_tag: String,
}

impl BuildParameters {
    pub const TARGET_BRANCH: &'static str = "TARGET_BRANCH";
    pub const REPO_URL: &'static str = "Repo_URL";
    pub const IMAGE_TAG: &'static str = "Tag";

    /// Form encoding used when triggering a build
    pub fn to_form(&self) -> [(&'static str, &str); 3] {
        [
            (Self::TARGET_BRANCH, self.target_branch.as_str()),
            (Self::REPO_URL, self.repo_url.as_str()),
            (Self::IMAGE_TAG, self.image_tag.as_str()),
        ]
    }
}

/// A build accepted into the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedBuild {
    pub queue_id: u64,
    pub job_name: String,
}

/// Build progress as reported by the build server
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BuildStatus {
    #[serde(default)]
    pub number: u64,

    /// SUCCESS, FAILURE, ABORTED, or absent while running
    #[serde(default)]
    pub result: Option<String>,

    #[serde(default)]
    pub building: bool,
}

impl BuildStatus {
    pub fn is_complete(&self) -> bool {
        !self.building
    }

    pub fn is_success(&self) -> bool {
        self.result.as_deref() == Some("SUCCESS")
    }
}

/// External build server
#[async_trait]
pub trait BuildServer: Send + Sync {
    async fn job_exists(&self, name: &str) -> Result<bool, ConveyorError>;

    async fn create_job(&self, name: &str, config_xml: &str) -> Result<(), ConveyorError>;

    async fn authenticate(&self) -> Result<(), ConveyorError>;

    async fn trigger_build(
        &self,
        name: &str,
        params: &BuildParameters,
    ) -> Result<QueuedBuild, ConveyorError>;

    /// Build number once the queue item has been scheduled, `None` while waiting
    async fn poll_queue(&self, queue_id: u64) -> Result<Option<u64>, ConveyorError>;

    async fn build_status(&self, name: &str, number: u64) -> Result<BuildStatus, ConveyorError>;
}

/// Jenkins REST client
pub struct JenkinsClient {
    http: HttpClient,
}

impl JenkinsClient {
    pub fn new(base_url: &str, auth: Option<BasicAuth>) -> Result<Self, ConveyorError> {
        Ok(Self {
            http: HttpClient::new(
                base_url,
                REQUEST_TIMEOUT,
                auth,
                ConveyorError::BuildServerError,
            )?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct QueueItem {
    #[serde(default)]
    executable: Option<QueueExecutable>,

    #[serde(default)]
    why: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueExecutable {
    #[serde(default)]
    number: u64,
}

#[async_trait]
impl BuildServer for JenkinsClient {
    async fn job_exists(&self, name: &str) -> Result<bool, ConveyorError> {
        let request = self
            .http
            .request_segments(Method::GET, &["job", name, "api", "json"])?;
        let response = request.send().await?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(self.http.error(format!(
                "unexpected status {} checking job {}",
                status, name
            ))),
        }
    }

    async fn create_job(&self, name: &str, config_xml: &str) -> Result<(), ConveyorError> {
        if name.trim().is_empty() {
            return Err(self.http.error("job name cannot be empty"));
        }
        if config_xml.trim().is_empty() {
            return Err(self.http.error("job config cannot be empty"));
        }

        let request = self
            .http
            .request_segments(Method::POST, &["createItem"])?
            .query(&[("name", name)])
            .header(header::CONTENT_TYPE, "application/xml")
            .body(config_xml.to_string());
        self.http.send(request).await?;

        info!("Build job created: {}", name);
        Ok(())
    }

    async fn authenticate(&self) -> Result<(), ConveyorError> {
        let request = self.http.request_segments(Method::GET, &["api", "json"])?;
        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(self.http.error(format!(
                "authentication failed with status {}",
                response.status()
            )));
        }
        debug!("Build server authentication successful");
        Ok(())
    }

    async fn trigger_build(
        &self,
        name: &str,
        params: &BuildParameters,
    ) -> Result<QueuedBuild, ConveyorError> {
        let request = self
            .http
            .request_segments(Method::POST, &["job", name, "buildWithParameters"])?
            .form(&params.to_form());
        let response = self.http.send(request).await?;

        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let queue_id = extract_queue_id(location)?;
        info!("Build for {} queued with id {}", name, queue_id);

        Ok(QueuedBuild {
            queue_id,
            job_name: name.to_string(),
        })
    }

    async fn poll_queue(&self, queue_id: u64) -> Result<Option<u64>, ConveyorError> {
        let id = queue_id.to_string();
        let request = self
            .http
            .request_segments(Method::GET, &["queue", "item", &id, "api", "json"])?;
        let item: QueueItem = self.http.send(request).await?.json().await?;

        match item.executable {
            Some(executable) if executable.number > 0 => Ok(Some(executable.number)),
            _ => {
                debug!(
                    "Queue item {} not scheduled yet: {}",
                    queue_id,
                    item.why.unwrap_or_default()
                );
                Ok(None)
            }
        }
    }

    async fn build_status(&self, name: &str, number: u64) -> Result<BuildStatus, ConveyorError> {
        let number = number.to_string();
        let request = self
            .http
            .request_segments(Method::GET, &["job", name, &number, "api", "json"])?;
        let status = self.http.send(request).await?.json().await?;
        Ok(status)
    }
}

fn queue_location_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/queue/item/(\d+)/?$").expect("static regex"))
}

/// Queue id from a trigger response `Location` header
pub fn extract_queue_id(location: &str) -> Result<u64, ConveyorError> {
    queue_location_pattern()
        .captures(location.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| {
            ConveyorError::BuildServerError(format!(
                "failed to extract queue id from location: {:?}",
                location
            ))
        })
}

/// Normalize line endings and escape the CDATA terminator
pub fn escape_pipeline_script(script: &str) -> String {
    script
        .replace("\\n", "\n")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace("]]>", "]]]]><![CDATA[>")
}

/// Pipeline job definition for a build template
pub fn job_config_xml(template: &BuildTemplate, params: &BuildParameters) -> String {
    let script = escape_pipeline_script(&template.pipeline);
    let parameter = |name: &str, description: &str, default: &str| {
        format!(
            r#"        <hudson.model.StringParameterDefinition>
          <name>{}</name>
          <description>{}</description>
          <defaultValue>{}</defaultValue>
          <trim>false</trim>
        </hudson.model.StringParameterDefinition>
"#,
            name,
            description,
            escape(default)
        )
    };

    let mut parameters = String::new();
    parameters.push_str(&parameter(
        BuildParameters::TARGET_BRANCH,
        "Target git branch",
        &params.target_branch,
    ));
    parameters.push_str(&parameter(
        BuildParameters::REPO_URL,
        "Git repository URL",
        &params.repo_url,
    ));
    parameters.push_str(&parameter(
        BuildParameters::IMAGE_TAG,
        "Image tag",
        &params.image_tag,
    ));

    format!(
        r#"<?xml version='1.1' encoding='UTF-8'?>
<flow-definition plugin="workflow-job">
  <description>Generated by Conveyor from build template {name}</description>
  <keepDependencies>false</keepDependencies>
  <properties>
    <hudson.model.ParametersDefinitionProperty>
      <parameterDefinitions>
{parameters}      </parameterDefinitions>
    </hudson.model.ParametersDefinitionProperty>
    <jenkins.model.BuildDiscarderProperty>
      <strategy class="hudson.tasks.LogRotator">
        <daysToKeep>-1</daysToKeep>
        <numToKeep>10</numToKeep>
        <artifactDaysToKeep>-1</artifactDaysToKeep>
        <artifactNumToKeep>-1</artifactNumToKeep>
      </strategy>
    </jenkins.model.BuildDiscarderProperty>
  </properties>
  <definition class="org.jenkinsci.plugins.workflow.cps.CpsFlowDefinition" plugin="workflow-cps">
    <script><![CDATA[{script}]]></script>
    <sandbox>true</sandbox>
  </definition>
  <triggers/>
  <disabled>false</disabled>
</flow-definition>"#,
        name = escape(template.name.as_str()),
        parameters = parameters,
        script = script,
    )
}
