//! Kubernetes implementation of the cluster client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams, PostParams};
use kube::config::AuthInfo;
use kube::{Api, Client, Config};
use secrecy::SecretString;
use tracing::{debug, info};

use conveyor_models::ClusterCredential;

use crate::ci::cluster::{ApplyOptions, ClusterClient, ClusterConnector, NamespaceOutcome};
use crate::errors::ConveyorError;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds one `kube::Client` per credential, no caching across tasks
#[derive(Debug, Default, Clone)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(
        &self,
        credential: &ClusterCredential,
    ) -> Result<Arc<dyn ClusterClient>, ConveyorError> {
        let config = client_config(credential)?;
        let client = Client::try_from(config)?;
        debug!("Connected to cluster {} ({})", credential.id, credential.api_server);
        Ok(Arc::new(KubeCluster { client }))
    }
}

/// Client configuration from stored credentials
///
/// A bearer token and a client certificate may both be present; the CA
/// bundle is optional and verification can be bypassed per cluster.
pub fn client_config(credential: &ClusterCredential) -> Result<Config, ConveyorError> {
    if !credential.enabled {
        return Err(ConveyorError::ClusterError(format!(
            "cluster {} is disabled",
            credential.id
        )));
    }

    let cluster_url: http::Uri = credential.api_server.trim().parse().map_err(|e| {
        ConveyorError::ClusterError(format!(
            "invalid api server {:?}: {}",
            credential.api_server, e
        ))
    })?;

    let mut config = Config::new(cluster_url);
    config.connect_timeout = Some(CONNECT_TIMEOUT);
    config.read_timeout = Some(READ_TIMEOUT);
    config.accept_invalid_certs = credential.skip_verify;

    if !credential.ca_cert.trim().is_empty() {
        config.root_cert = Some(pem_certificates(&credential.ca_cert)?);
    }

    let mut auth_info = AuthInfo::default();
    if !credential.token.trim().is_empty() {
        auth_info.token = Some(SecretString::from(credential.token.trim().to_string()));
    }
    if !credential.client_cert.trim().is_empty() && !credential.client_key.trim().is_empty() {
        auth_info.client_certificate_data = Some(BASE64.encode(credential.client_cert.as_bytes()));
        auth_info.client_key_data = Some(SecretString::from(
            BASE64.encode(credential.client_key.as_bytes()),
        ));
    }
    config.auth_info = auth_info;

    Ok(config)
}

/// DER certificates from a PEM bundle
pub fn pem_certificates(pem: &str) -> Result<Vec<Vec<u8>>, ConveyorError> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConveyorError::ClusterError(format!("invalid CA certificate: {}", e)))?;

    if certs.is_empty() {
        return Err(ConveyorError::ClusterError(
            "CA certificate contains no PEM certificates".to_string(),
        ));
    }
    Ok(certs)
}

/// Live cluster handle
pub struct KubeCluster {
    client: Client,
}

fn patch_params(options: &ApplyOptions) -> PatchParams {
    let params = PatchParams::apply(&options.field_manager);
    if options.force_conflicts {
        params.force()
    } else {
        params
    }
}

fn object_key(metadata: &ObjectMeta, kind: &str) -> Result<(String, String), ConveyorError> {
    let name = metadata.name.clone().unwrap_or_default();
    let namespace = metadata.namespace.clone().unwrap_or_default();
    if name.is_empty() || namespace.is_empty() {
        return Err(ConveyorError::ClusterError(format!(
            "{} requires a name and namespace (got {:?}/{:?})",
            kind, namespace, name
        )));
    }
    Ok((namespace, name))
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn ensure_namespace(&self, name: &str) -> Result<NamespaceOutcome, ConveyorError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(name).await?.is_some() {
            debug!("Namespace {} already exists", name);
            return Ok(NamespaceOutcome::Existing);
        }

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!("Created namespace {}", name);
                Ok(NamespaceOutcome::Created)
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                debug!("Namespace {} created concurrently", name);
                Ok(NamespaceOutcome::Existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_config_map(
        &self,
        config_map: &ConfigMap,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError> {
        let (namespace, name) = object_key(&config_map.metadata, "ConfigMap")?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(&name, &patch_params(options), &Patch::Apply(config_map))
            .await?;
        Ok(())
    }

    async fn apply_service(
        &self,
        service: &Service,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError> {
        let (namespace, name) = object_key(&service.metadata, "Service")?;
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(&name, &patch_params(options), &Patch::Apply(service))
            .await?;
        Ok(())
    }

    async fn apply_deployment(
        &self,
        deployment: &Deployment,
        options: &ApplyOptions,
    ) -> Result<(), ConveyorError> {
        let (namespace, name) = object_key(&deployment.metadata, "Deployment")?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(&name, &patch_params(options), &Patch::Apply(deployment))
            .await?;
        Ok(())
    }
}
