//! Typed server-side apply of rendered manifests
//!
//! Each document is dispatched on its `kind`. Only Namespace, ConfigMap,
//! Service and Deployment are understood; every other kind is logged and
//! skipped. The typed objects sent to the cluster are reduced to the fields
//! this engine owns:
//!
//! - ConfigMap: `data`, `binaryData`
//! - Service: `ports` (name, port, targetPort) and `selector`
//! - Deployment: `replicas`, `selector`, pod template labels and containers
//!   (name, image, container ports, `envFrom` config map references)
//!
//! Everything else in the template is dropped before the apply.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::ci::cluster::{ApplyOptions, ClusterClient, NamespaceOutcome};
use crate::deploy::manifest::Dynamic;
use crate::errors::ConveyorError;

/// Result of dispatching one document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Namespace {
        name: String,
        outcome: NamespaceOutcome,
    },
    Applied {
        kind: String,
        namespace: String,
        name: String,
    },
    Skipped {
        kind: String,
    },
}

/// Applies manifests of one task to one cluster
pub struct ManifestApplier<'a> {
    client: &'a dyn ClusterClient,
    options: ApplyOptions,
    image_tag: String,
    fallback_namespace: String,
}

impl<'a> ManifestApplier<'a> {
    /// `fallback_namespace` fills in resources whose template names none
    pub fn new(
        client: &'a dyn ClusterClient,
        options: ApplyOptions,
        image_tag: impl Into<String>,
        fallback_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            options,
            image_tag: image_tag.into(),
            fallback_namespace: fallback_namespace.into(),
        }
    }

    /// Parse and dispatch every document in order, stopping at the first error
    pub async fn apply_documents(
        &self,
        documents: &[String],
    ) -> Result<Vec<Dispatch>, ConveyorError> {
        let mut dispatched = Vec::with_capacity(documents.len());
        for (index, doc) in documents.iter().enumerate() {
            let manifest = Dynamic::from_yaml_str(doc).map_err(|e| {
                ConveyorError::TemplateError(format!("document {}: {}", index + 1, e))
            })?;
            dispatched.push(self.apply(&manifest).await?);
        }
        Ok(dispatched)
    }

    /// Dispatch one parsed manifest on its kind
    pub async fn apply(&self, manifest: &Dynamic) -> Result<Dispatch, ConveyorError> {
        if manifest.as_map().is_none() {
            return Err(ConveyorError::TemplateError(
                "manifest is not a mapping".to_string(),
            ));
        }
        let kind = manifest.kind();
        if kind.is_empty() {
            return Err(ConveyorError::TemplateError(
                "manifest is missing kind".to_string(),
            ));
        }

        match kind.as_str() {
            "Namespace" => {
                let name = manifest.metadata_field("name");
                if name.is_empty() {
                    return Err(ConveyorError::ManifestError(
                        "Namespace without metadata.name".to_string(),
                    ));
                }
                let outcome = self.client.ensure_namespace(&name).await?;
                info!("Applied Namespace {} ({:?})", name, outcome);
                Ok(Dispatch::Namespace { name, outcome })
            }
            "ConfigMap" => {
                let config_map = reduce_config_map(typed(manifest, &self.fallback_namespace)?);
                self.client
                    .apply_config_map(&config_map, &self.options)
                    .await?;
                Ok(self.applied(kind, &config_map.metadata))
            }
            "Service" => {
                let service = reduce_service(typed(manifest, &self.fallback_namespace)?);
                self.client.apply_service(&service, &self.options).await?;
                Ok(self.applied(kind, &service.metadata))
            }
            "Deployment" => {
                let deployment = reduce_deployment(
                    typed(manifest, &self.fallback_namespace)?,
                    &self.image_tag,
                )?;
                self.client
                    .apply_deployment(&deployment, &self.options)
                    .await?;
                Ok(self.applied(kind, &deployment.metadata))
            }
            _ => {
                warn!("Unsupported resource kind {}, skipped", kind);
                Ok(Dispatch::Skipped { kind })
            }
        }
    }

    fn applied(&self, kind: String, metadata: &ObjectMeta) -> Dispatch {
        let namespace = metadata.namespace.clone().unwrap_or_default();
        let name = metadata.name.clone().unwrap_or_default();
        info!("Applied {} {}/{}", kind, namespace, name);
        Dispatch::Applied {
            kind,
            namespace,
            name,
        }
    }
}

/// Resources whose metadata a typed object exposes
pub trait HasMetadata {
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

impl HasMetadata for ConfigMap {
    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl HasMetadata for Service {
    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl HasMetadata for Deployment {
    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Convert an untyped manifest into a typed resource
///
/// `apiVersion` and `kind` are dropped before conversion, as is a
/// `metadata` that is not a mapping. Blank name or namespace is backfilled
/// from `metadata_field`, then from `fallback_namespace`.
pub fn typed<T>(manifest: &Dynamic, fallback_namespace: &str) -> Result<T, ConveyorError>
where
    T: DeserializeOwned + HasMetadata,
{
    let kind = manifest.kind();
    let mut json = manifest.to_json();
    if let Some(object) = json.as_object_mut() {
        object.remove("apiVersion");
        object.remove("kind");
        if !object.get("metadata").is_some_and(|m| m.is_object()) {
            object.remove("metadata");
        }
    }

    let mut resource: T = serde_json::from_value(json).map_err(|e| {
        ConveyorError::ManifestError(format!("failed to convert {}: {}", kind, e))
    })?;

    let metadata = resource.metadata_mut();
    if metadata.name.as_deref().unwrap_or_default().is_empty() {
        metadata.name = Some(manifest.metadata_field("name")).filter(|n| !n.is_empty());
    }
    if metadata.namespace.as_deref().unwrap_or_default().is_empty() {
        let extracted = manifest.metadata_field("namespace");
        let namespace = if extracted.is_empty() {
            fallback_namespace.trim().to_string()
        } else {
            extracted
        };
        metadata.namespace = Some(namespace).filter(|n| !n.is_empty());
    }

    Ok(resource)
}

fn owned_metadata(metadata: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: metadata.name.clone(),
        namespace: metadata.namespace.clone(),
        ..Default::default()
    }
}

pub fn reduce_config_map(config_map: ConfigMap) -> ConfigMap {
    ConfigMap {
        metadata: owned_metadata(&config_map.metadata),
        data: config_map.data,
        binary_data: config_map.binary_data,
        ..Default::default()
    }
}

pub fn reduce_service(service: Service) -> Service {
    let spec = service.spec.unwrap_or_default();
    let ports = spec.ports.map(|ports| {
        ports
            .into_iter()
            .map(|p| ServicePort {
                name: p.name,
                port: p.port,
                target_port: p.target_port,
                ..Default::default()
            })
            .collect()
    });

    Service {
        metadata: owned_metadata(&service.metadata),
        spec: Some(ServiceSpec {
            ports,
            selector: spec.selector,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Reduce a Deployment and point every container at `image_tag`
pub fn reduce_deployment(deployment: Deployment, image_tag: &str) -> Result<Deployment, ConveyorError> {
    let spec = deployment.spec.ok_or_else(|| {
        ConveyorError::ManifestError(format!(
            "Deployment {} has no spec",
            deployment.metadata.name.clone().unwrap_or_default()
        ))
    })?;

    let template_labels = spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone());
    let containers = spec
        .template
        .spec
        .map(|pod| pod.containers)
        .unwrap_or_default()
        .into_iter()
        .map(|c| reduce_container(c, image_tag))
        .collect();

    Ok(Deployment {
        metadata: owned_metadata(&deployment.metadata),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas.unwrap_or(1)),
            selector: LabelSelector {
                match_labels: spec.selector.match_labels,
                match_expressions: spec.selector.match_expressions,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: template_labels,
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn reduce_container(container: Container, image_tag: &str) -> Container {
    let ports = container.ports.map(|ports| {
        ports
            .into_iter()
            .map(|p| ContainerPort {
                container_port: p.container_port,
                ..Default::default()
            })
            .collect()
    });
    let env_from = container.env_from.map(|sources| {
        sources
            .into_iter()
            .filter_map(|source| source.config_map_ref)
            .map(|config_map_ref| EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    optional: Some(config_map_ref.optional.unwrap_or(false)),
                    ..config_map_ref
                }),
                ..Default::default()
            })
            .collect()
    });
    let image = container
        .image
        .filter(|image| !image.trim().is_empty())
        .map(|image| rewrite_image(&image, image_tag));

    Container {
        name: container.name,
        image,
        ports,
        env_from,
        ..Default::default()
    }
}

/// Replace or append the tag of an image reference
///
/// The tag separator is the last `:` after the last `/`, so registry ports
/// survive. A digest is dropped.
pub fn rewrite_image(image: &str, tag: &str) -> String {
    let image = image.trim();
    let without_digest = image.split('@').next().unwrap_or(image);
    let name_start = without_digest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let repository = match without_digest[name_start..].rfind(':') {
        Some(i) => &without_digest[..name_start + i],
        None => without_digest,
    };
    format!("{}:{}", repository, tag)
}
