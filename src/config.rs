use crate::deploy::DeployStrategy;
use crate::retry::RetryConfig;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub package: PackageConfig,
    pub publish: PublishConfig,
    /// Written as `eks: {...}` or `kubeconfig: {path|inline: ...}`
    #[serde(with = "serde_yaml_ng::with::singleton_map_recursive")]
    pub cluster: ClusterConfig,
    pub deployment: DeploymentConfig,
    #[serde(default)]
    pub strategy: DeployStrategy,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Toolchain container that compiles the binary. The working directory is
/// mounted at `/src`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    pub image: String,
    pub workdir: PathBuf,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Path of the produced artifact inside the build container
    pub output: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            image: "golang:latest".to_string(),
            workdir: PathBuf::from("."),
            command: ["go", "build", "-o", "hello"]
                .into_iter()
                .map(String::from)
                .collect(),
            env: BTreeMap::from([
                ("GOOS".to_string(), "linux".to_string()),
                ("GOARCH".to_string(), "amd64".to_string()),
                ("CGO_ENABLED".to_string(), "0".to_string()),
            ]),
            output: "/src/hello".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PackageConfig {
    pub base_image: String,
    /// Destination of the artifact in the runtime image, also its entrypoint
    pub entrypoint: String,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            base_image: "alpine:latest".to_string(),
            entrypoint: "/bin/hello".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishConfig {
    /// Fully qualified destination including tag
    pub image: String,
    pub registry: Option<RegistryCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryCredentials {
    pub username: Option<String>,
    pub token: SecretString,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClusterConfig {
    Eks(EksConfig),
    Kubeconfig(KubeconfigSource),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EksConfig {
    pub cluster_name: String,
    pub region: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KubeconfigSource {
    Path(PathBuf),
    Inline(SecretString),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfig {
    pub namespace: String,
    pub name: String,
    /// Container name for created deployments, defaults to the deployment name
    pub container: Option<String>,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default)]
    pub port: PortConfig,
    /// Pod labels and selector for created deployments, defaults to `app: <name>`
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl DeploymentConfig {
    pub fn container_name(&self) -> &str {
        self.container.as_deref().unwrap_or(&self.name)
    }

    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        if self.labels.is_empty() {
            BTreeMap::from([("app".to_string(), self.name.clone())])
        } else {
            self.labels.clone()
        }
    }
}

fn default_replicas() -> i32 {
    2
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortConfig {
    pub name: String,
    pub container_port: i32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            name: "http".to_string(),
            container_port: 8080,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    parse_config(&yaml_str)
}

pub fn parse_config(yaml_str: &str) -> Result<Config> {
    let expanded = expand_env_vars(yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    if config.build.command.is_empty() {
        anyhow::bail!("build.command must not be empty");
    }
    if config.deployment.replicas < 0 {
        anyhow::bail!("deployment.replicas must not be negative");
    }
    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    if let Some(var_name) = missing {
        anyhow::bail!("Missing environment variable: {}", var_name);
    }
    Ok(result.into_owned())
}
