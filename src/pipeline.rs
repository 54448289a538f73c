use crate::cluster::AuthError;
use crate::config::Config;
use crate::deploy::{DeployError, DeployStrategy, DeploymentApi};
use crate::engine::{EngineError, ImageEngine};
use crate::image_reference::{ImageReference, ParseError};
use crate::oci_registry;
use k8s_openapi::api::apps::v1::Deployment;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid image reference {0}")]
    InvalidImage(String, #[source] ParseError),

    #[error("build stage failed")]
    Build(#[source] EngineError),

    #[error("package stage failed")]
    Package(#[source] EngineError),

    #[error("publish stage failed")]
    Publish(#[source] EngineError),

    #[error("could not resolve the digest of {0}: {1}")]
    Digest(String, String),

    #[error("cluster authentication failed")]
    Auth(#[from] AuthError),

    #[error("deploy stage failed")]
    Deploy(#[from] DeployError),
}

/// What a successful run leaves behind.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub image: ImageReference,
    pub strategy: DeployStrategy,
    pub deployment: Deployment,
}

/// Build, package and publish. Returns the pushed reference pinned to its
/// manifest digest.
pub async fn publish_image<E: ImageEngine>(
    engine: &E,
    config: &Config,
    workdir: &Path,
) -> Result<ImageReference, PipelineError> {
    let target = parse_image(&config.publish.image)?;

    info!("Build stage: compiling in {}", config.build.image);
    let artifact = engine
        .build(&config.build, workdir)
        .await
        .map_err(PipelineError::Build)?;

    info!("Package stage: {} on {}", artifact.file_name, config.package.base_image);
    engine
        .package(&artifact, &config.package, &target)
        .await
        .map_err(PipelineError::Package)?;

    info!("Publish stage: pushing {}", target);
    let credentials = config.publish.registry.as_ref();
    let digest = match engine
        .push(&target, credentials)
        .await
        .map_err(PipelineError::Publish)?
    {
        Some(digest) => digest,
        None => {
            warn!("Engine did not report a digest for {}, asking the registry", target);
            let client = oci_registry::create_client()
                .map_err(|e| PipelineError::Digest(target.to_string(), format!("{:#}", e)))?;
            oci_registry::fetch_digest_from_tag(&target, credentials, &client)
                .await
                .map_err(|e| PipelineError::Digest(target.to_string(), format!("{:#}", e)))?
        }
    };

    target
        .with_digest(&digest)
        .map_err(|e| PipelineError::InvalidImage(digest.clone(), e))
}

pub fn parse_image(image: &str) -> Result<ImageReference, PipelineError> {
    ImageReference::parse(image).map_err(|e| PipelineError::InvalidImage(image.to_string(), e))
}

pub async fn deploy<A: DeploymentApi>(
    api: &A,
    config: &Config,
    strategy: DeployStrategy,
    image: ImageReference,
) -> Result<PipelineOutcome, PipelineError> {
    let deployment = strategy
        .apply(api, &config.deployment, &image, &config.retry)
        .await?;
    Ok(PipelineOutcome {
        image,
        strategy,
        deployment,
    })
}
