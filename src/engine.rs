use crate::config::{BuildConfig, PackageConfig, RegistryCredentials};
use crate::image_reference::ImageReference;
use bytes::Bytes;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to connect to the container engine")]
    Connect(#[source] bollard::errors::Error),

    #[error("failed to pull image {0}")]
    Pull(String, #[source] bollard::errors::Error),

    #[error("container engine failed to {0}")]
    Engine(&'static str, #[source] bollard::errors::Error),

    #[error("build command exited with status {0}")]
    BuildFailed(i64),

    #[error("build artifact {0} was not produced")]
    MissingArtifact(String),

    #[error("invalid build working directory {0}")]
    Workdir(String, #[source] io::Error),

    #[error("failed to archive build artifact")]
    Archive(#[source] io::Error),

    #[error("entrypoint {0} must be an absolute file path")]
    InvalidEntrypoint(String),

    #[error("failed to push {0}")]
    Push(String, #[source] bollard::errors::Error),
}

/// The compiled binary, carried from the build container to the runtime
/// image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub file_name: String,
    pub contents: Bytes,
    pub mode: u32,
}

/// Container engine operations behind the build, package and publish stages.
pub trait ImageEngine {
    /// Runs the build command in the toolchain image with `workdir` mounted
    /// at `/src` and returns the file found at `build.output`.
    async fn build(&self, build: &BuildConfig, workdir: &Path) -> Result<Artifact, EngineError>;

    /// Commits `base_image` plus the artifact at `package.entrypoint` as
    /// `target`, with the artifact as entrypoint.
    async fn package(
        &self,
        artifact: &Artifact,
        package: &PackageConfig,
        target: &ImageReference,
    ) -> Result<(), EngineError>;

    /// Pushes `target` and returns the manifest digest if the engine
    /// reported one.
    async fn push(
        &self,
        target: &ImageReference,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<Option<String>, EngineError>;
}

/// Splits an absolute entrypoint such as `/bin/hello` into its directory
/// and file name.
pub fn split_entrypoint(entrypoint: &str) -> Result<(&str, &str), EngineError> {
    let invalid = || EngineError::InvalidEntrypoint(entrypoint.to_string());
    if !entrypoint.starts_with('/') {
        return Err(invalid());
    }
    let (directory, file_name) = entrypoint.rsplit_once('/').ok_or_else(invalid)?;
    if file_name.is_empty() {
        return Err(invalid());
    }
    Ok((if directory.is_empty() { "/" } else { directory }, file_name))
}

/// Single entry tar archive, as the engine expects for uploads.
pub fn artifact_archive(artifact: &Artifact, file_name: &str) -> Result<Bytes, EngineError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(artifact.contents.len() as u64);
    header.set_mode(artifact.mode);
    header.set_entry_type(tar::EntryType::Regular);

    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_data(&mut header, file_name, artifact.contents.as_ref())
        .map_err(EngineError::Archive)?;
    let archive = builder.into_inner().map_err(EngineError::Archive)?;
    Ok(Bytes::from(archive))
}

/// Reads the first regular file out of an archive downloaded from a
/// container.
pub fn extract_artifact(archive: &[u8], path: &str) -> Result<Artifact, EngineError> {
    let mut entries = tar::Archive::new(archive);
    for entry in entries.entries().map_err(EngineError::Archive)? {
        let mut entry = entry.map_err(EngineError::Archive)?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let mode = entry.header().mode().map_err(EngineError::Archive)?;
        let file_name = entry
            .path()
            .map_err(EngineError::Archive)?
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::MissingArtifact(path.to_string()))?;
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(EngineError::Archive)?;
        return Ok(Artifact {
            file_name,
            contents: Bytes::from(contents),
            mode,
        });
    }
    Err(EngineError::MissingArtifact(path.to_string()))
}

/// Picks the digest out of the final push status line, e.g.
/// `latest: digest: sha256:1ab3... size: 528`.
pub fn digest_from_push_status(status: &str) -> Option<String> {
    let mut words = status.split_whitespace();
    words.find(|word| *word == "digest:")?;
    words
        .next()
        .filter(|digest| digest.contains(':'))
        .map(str::to_string)
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;

    /// Records the calls the pipeline makes and answers with canned results.
    #[derive(Default)]
    pub struct FakeEngine {
        pub calls: RefCell<Vec<String>>,
        pub digest: Option<String>,
        pub fail_build: bool,
    }

    impl ImageEngine for FakeEngine {
        async fn build(
            &self,
            build: &BuildConfig,
            _workdir: &Path,
        ) -> Result<Artifact, EngineError> {
            self.calls.borrow_mut().push(format!("build {}", build.image));
            if self.fail_build {
                return Err(EngineError::BuildFailed(2));
            }
            Ok(Artifact {
                file_name: "hello".to_string(),
                contents: Bytes::from_static(b"\x7fELF"),
                mode: 0o755,
            })
        }

        async fn package(
            &self,
            artifact: &Artifact,
            package: &PackageConfig,
            target: &ImageReference,
        ) -> Result<(), EngineError> {
            self.calls.borrow_mut().push(format!(
                "package {} {} {} {}",
                artifact.file_name, package.base_image, package.entrypoint, target
            ));
            Ok(())
        }

        async fn push(
            &self,
            target: &ImageReference,
            _credentials: Option<&RegistryCredentials>,
        ) -> Result<Option<String>, EngineError> {
            self.calls.borrow_mut().push(format!("push {}", target));
            Ok(self.digest.clone())
        }
    }
}
