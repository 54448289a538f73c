use crate::config::{BuildConfig, PackageConfig, RegistryCredentials};
use crate::engine::{
    Artifact, EngineError, ImageEngine, artifact_archive, digest_from_push_status,
    extract_artifact, split_entrypoint,
};
use crate::image_reference::ImageReference;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::LogOutput;
use bollard::models::{ContainerConfig, ContainerCreateBody, HostConfig, Mount, MountTypeEnum};
use bollard::query_parameters::{
    CommitContainerOptionsBuilder, CreateContainerOptions, CreateImageOptions,
    DownloadFromContainerOptionsBuilder, LogsOptions, PushImageOptionsBuilder,
    RemoveContainerOptions, StartContainerOptions, UploadToContainerOptionsBuilder,
    WaitContainerOptions,
};
use futures::StreamExt;
use std::path::Path;
use tracing::{debug, info, warn};

static SOURCE_MOUNT: &str = "/src";
static DEFAULT_TAG: &str = "latest";

/// Docker Engine API over the local socket. Works against Podman's
/// Docker-compatible socket as well.
pub struct DockerEngine {
    client: Docker,
}

impl DockerEngine {
    pub async fn connect() -> Result<Self, EngineError> {
        let client = Docker::connect_with_local_defaults().map_err(EngineError::Connect)?;
        let version = client.version().await.map_err(EngineError::Connect)?;
        info!(
            "Connected to container engine {}",
            version.version.as_deref().unwrap_or("unknown")
        );
        Ok(Self { client })
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };

        // Pull returns a stream of progress updates
        let mut stream = self.client.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| EngineError::Pull(image.to_string(), e))?;
        }
        Ok(())
    }

    async fn create(&self, body: ContainerCreateBody) -> Result<String, EngineError> {
        let response = self
            .client
            .create_container(None::<CreateContainerOptions>, body)
            .await
            .map_err(|e| EngineError::Engine("create container", e))?;
        debug!("Created container {}", response.id);
        Ok(response.id)
    }

    async fn remove(&self, id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.client.remove_container(id, Some(options)).await {
            warn!("Failed to remove container {}: {}", id, e);
        }
    }

    async fn run_build(&self, id: &str, output: &str) -> Result<Artifact, EngineError> {
        self.client
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| EngineError::Engine("start build container", e))?;

        let log_options = LogsOptions {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.client.logs(id, Some(log_options));
        while let Some(result) = logs.next().await {
            match result {
                Ok(LogOutput::StdErr { message }) | Ok(LogOutput::StdOut { message }) => {
                    info!("[build] {}", String::from_utf8_lossy(&message).trim_end())
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Build log stream ended: {}", e);
                    break;
                }
            }
        }

        let mut wait = self
            .client
            .wait_container(id, None::<WaitContainerOptions>);
        while let Some(result) = wait.next().await {
            match result {
                Ok(response) if response.status_code != 0 => {
                    return Err(EngineError::BuildFailed(response.status_code));
                }
                Ok(_) => {}
                Err(bollard::errors::Error::DockerContainerWaitError { code, .. }) => {
                    return Err(EngineError::BuildFailed(code));
                }
                Err(e) => return Err(EngineError::Engine("wait for build container", e)),
            }
        }

        let options = DownloadFromContainerOptionsBuilder::default()
            .path(output)
            .build();
        let mut stream = self.client.download_from_container(id, Some(options));
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(EngineError::MissingArtifact(output.to_string())),
                Err(e) => return Err(EngineError::Engine("download build artifact", e)),
            }
        }
        extract_artifact(&archive, output)
    }

    async fn commit_runtime_image(
        &self,
        id: &str,
        artifact: &Artifact,
        package: &PackageConfig,
        target: &ImageReference,
    ) -> Result<(), EngineError> {
        let (directory, file_name) = split_entrypoint(&package.entrypoint)?;
        let archive = artifact_archive(artifact, file_name)?;

        let options = UploadToContainerOptionsBuilder::default()
            .path(directory)
            .build();
        self.client
            .upload_to_container(id, Some(options), bollard::body_full(archive))
            .await
            .map_err(|e| EngineError::Engine("copy artifact into runtime image", e))?;

        let tag = target.tag.as_deref().unwrap_or(DEFAULT_TAG);
        let options = CommitContainerOptionsBuilder::default()
            .container(id)
            .repo(&target.name())
            .tag(tag)
            .build();
        let config = ContainerConfig {
            entrypoint: Some(vec![package.entrypoint.clone()]),
            ..Default::default()
        };
        self.client
            .commit_container(options, config)
            .await
            .map_err(|e| EngineError::Engine("commit runtime image", e))?;
        Ok(())
    }
}

impl ImageEngine for DockerEngine {
    async fn build(&self, build: &BuildConfig, workdir: &Path) -> Result<Artifact, EngineError> {
        let source = workdir
            .canonicalize()
            .map_err(|e| EngineError::Workdir(workdir.display().to_string(), e))?;
        self.pull(&build.image).await?;

        info!(
            "Building {} in {} with {:?}",
            source.display(),
            build.image,
            build.command
        );
        let body = ContainerCreateBody {
            image: Some(build.image.clone()),
            cmd: Some(build.command.clone()),
            env: Some(
                build
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            working_dir: Some(SOURCE_MOUNT.to_string()),
            host_config: Some(HostConfig {
                mounts: Some(vec![Mount {
                    source: Some(source.display().to_string()),
                    target: Some(SOURCE_MOUNT.to_string()),
                    typ: Some(MountTypeEnum::BIND),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let id = self.create(body).await?;

        let result = self.run_build(&id, &build.output).await;
        self.remove(&id).await;
        let artifact = result?;
        info!(
            "Built artifact {} ({} bytes)",
            artifact.file_name,
            artifact.contents.len()
        );
        Ok(artifact)
    }

    async fn package(
        &self,
        artifact: &Artifact,
        package: &PackageConfig,
        target: &ImageReference,
    ) -> Result<(), EngineError> {
        self.pull(&package.base_image).await?;

        info!(
            "Packaging {} on {} as {}",
            artifact.file_name, package.base_image, target
        );
        let body = ContainerCreateBody {
            image: Some(package.base_image.clone()),
            entrypoint: Some(vec![package.entrypoint.clone()]),
            ..Default::default()
        };
        let id = self.create(body).await?;

        let result = self
            .commit_runtime_image(&id, artifact, package, target)
            .await;
        self.remove(&id).await;
        result
    }

    async fn push(
        &self,
        target: &ImageReference,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<Option<String>, EngineError> {
        let name = target.name();
        let tag = target.tag.as_deref().unwrap_or(DEFAULT_TAG);
        info!("Pushing {}:{}", name, tag);

        let credentials = credentials.map(|c| DockerCredentials {
            username: c.username.clone(),
            password: Some(c.token.expose_secret().to_string()),
            serveraddress: Some(target.registry.clone()),
            ..Default::default()
        });
        let options = PushImageOptionsBuilder::default().tag(tag).build();

        let mut digest = None;
        let mut stream = self.client.push_image(&name, Some(options), credentials);
        while let Some(result) = stream.next().await {
            let info = result.map_err(|e| EngineError::Push(target.to_string(), e))?;
            if let Some(status) = info.status.as_deref() {
                debug!("push: {}", status);
                if let Some(reported) = digest_from_push_status(status) {
                    digest = Some(reported);
                }
            }
        }
        Ok(digest)
    }
}
