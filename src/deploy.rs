use crate::config::DeploymentConfig;
use crate::image_reference::ImageReference;
use crate::retry::{RetryConfig, retry_on_conflict};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::PostParams;
use kube::{Api, Client};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deployment {0} was modified concurrently: {1}")]
    Conflict(String, String),

    #[error("deployment {0} already exists: {1}")]
    AlreadyExists(String, String),

    #[error("deployment {name} not found in namespace {namespace}")]
    NotFound { namespace: String, name: String },

    #[error("deployment {0} has no containers in its pod template")]
    NoContainers(String),

    #[error("Kubernetes API request for deployment {0} failed")]
    Api(String, #[source] kube::Error),
}

impl DeployError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DeployError::Conflict(..))
    }
}

/// The `apps/v1` Deployment calls a strategy needs, scoped to one namespace.
pub trait DeploymentApi {
    fn namespace(&self) -> &str;
    async fn get(&self, name: &str) -> Result<Deployment, DeployError>;
    /// Full update; the server rejects it with a conflict when the
    /// `resourceVersion` carried by `deployment` is stale.
    async fn replace(&self, name: &str, deployment: &Deployment) -> Result<Deployment, DeployError>;
    async fn create(&self, deployment: &Deployment) -> Result<Deployment, DeployError>;
}

pub struct KubeDeployments {
    api: Api<Deployment>,
    namespace: String,
}

impl KubeDeployments {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

impl DeploymentApi for KubeDeployments {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn get(&self, name: &str) -> Result<Deployment, DeployError> {
        debug!("Fetching deployment {}/{}", self.namespace, name);
        self.api
            .get(name)
            .await
            .map_err(|e| map_api_error(ApiCall::Get, &self.namespace, name, e))
    }

    async fn replace(&self, name: &str, deployment: &Deployment) -> Result<Deployment, DeployError> {
        debug!("Replacing deployment {}/{}", self.namespace, name);
        self.api
            .replace(name, &PostParams::default(), deployment)
            .await
            .map_err(|e| map_api_error(ApiCall::Replace, &self.namespace, name, e))
    }

    async fn create(&self, deployment: &Deployment) -> Result<Deployment, DeployError> {
        let name = deployment.metadata.name.as_deref().unwrap_or_default();
        debug!("Creating deployment {}/{}", self.namespace, name);
        self.api
            .create(&PostParams::default(), deployment)
            .await
            .map_err(|e| map_api_error(ApiCall::Create, &self.namespace, name, e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApiCall {
    Get,
    Replace,
    Create,
}

/// A 409 means a stale `resourceVersion` on replace but an existing object on
/// create. 404 is only meaningful for reads.
fn map_api_error(call: ApiCall, namespace: &str, name: &str, error: kube::Error) -> DeployError {
    match (call, error) {
        (ApiCall::Get, kube::Error::Api(response)) if response.code == 404 => {
            DeployError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        }
        (ApiCall::Replace, kube::Error::Api(response)) if response.code == 409 => {
            DeployError::Conflict(name.to_string(), response.message)
        }
        (ApiCall::Create, kube::Error::Api(response)) if response.code == 409 => {
            DeployError::AlreadyExists(name.to_string(), response.message)
        }
        (_, e) => DeployError::Api(name.to_string(), e),
    }
}

/// How the new image reaches the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeployStrategy {
    /// Swap the image of the first container of an existing Deployment,
    /// retrying on optimistic-concurrency conflicts.
    #[default]
    Rolling,

    /// Create a new Deployment from configuration. Fails if it already exists.
    Create,
}

impl fmt::Display for DeployStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployStrategy::Rolling => write!(f, "rolling"),
            DeployStrategy::Create => write!(f, "create"),
        }
    }
}

impl DeployStrategy {
    pub async fn apply<A: DeploymentApi>(
        self,
        api: &A,
        config: &DeploymentConfig,
        image: &ImageReference,
        retry: &RetryConfig,
    ) -> Result<Deployment, DeployError> {
        info!(
            "Applying {} strategy to deployment {}/{} with image {}",
            self,
            api.namespace(),
            config.name,
            image
        );
        match self {
            DeployStrategy::Rolling => rolling_update(api, &config.name, image, retry).await,
            DeployStrategy::Create => create_deployment(api, config, image).await,
        }
    }
}

pub async fn rolling_update<A: DeploymentApi>(
    api: &A,
    name: &str,
    image: &ImageReference,
    retry: &RetryConfig,
) -> Result<Deployment, DeployError> {
    let image = image.to_string();
    let image = image.as_str();

    let updated = retry_on_conflict(retry, DeployError::is_conflict, |attempt| async move {
        let mut deployment = api.get(name).await?;
        debug!(
            "Attempt {}: updating deployment {} at resourceVersion {:?}",
            attempt, name, deployment.metadata.resource_version
        );
        set_first_container_image(&mut deployment, name, image)?;
        api.replace(name, &deployment).await
    })
    .await?;

    info!("Updated deployment {} to image {}", name, image);
    Ok(updated)
}

pub async fn create_deployment<A: DeploymentApi>(
    api: &A,
    config: &DeploymentConfig,
    image: &ImageReference,
) -> Result<Deployment, DeployError> {
    let deployment = build_deployment(config, api.namespace(), image);
    let created = api.create(&deployment).await?;
    info!(
        "Created deployment {} with {} replicas",
        config.name, config.replicas
    );
    Ok(created)
}

fn set_first_container_image(
    deployment: &mut Deployment,
    name: &str,
    image: &str,
) -> Result<(), DeployError> {
    let container = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .and_then(|pod_spec| pod_spec.containers.first_mut())
        .ok_or_else(|| DeployError::NoContainers(name.to_string()))?;

    debug!(
        "Container {} image {:?} -> {}",
        container.name, container.image, image
    );
    container.image = Some(image.to_string());
    Ok(())
}

pub fn build_deployment(
    config: &DeploymentConfig,
    namespace: &str,
    image: &ImageReference,
) -> Deployment {
    let labels = config.selector_labels();

    Deployment {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(config.replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: config.container_name().to_string(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some(config.port.name.clone()),
                            container_port: config.port.container_port,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
