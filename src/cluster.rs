use crate::config::{ClusterConfig, EksConfig, KubeconfigSource};
use crate::eks::{self, ClusterEndpoint};
use crate::secret_string::SecretString;
use kube::Client;
use kube::config::{KubeConfigOptions, Kubeconfig, KubeconfigError};
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("DescribeCluster for {0} failed: {1}")]
    DescribeCluster(String, String),

    #[error("DescribeCluster response for {0} has no {1}")]
    IncompleteCluster(String, &'static str),

    #[error("failed to generate a token for cluster {0}: {1}")]
    Token(String, String),

    #[error("certificate authority data of cluster {0} is not valid base64")]
    CertificateDecode(String, #[source] base64::DecodeError),

    #[error("kubeconfig is empty")]
    EmptyKubeconfig,

    #[error("failed to read kubeconfig {0}")]
    ReadKubeconfig(PathBuf, #[source] std::io::Error),

    #[error("invalid kubeconfig")]
    Kubeconfig(#[source] KubeconfigError),

    #[error("failed to create Kubernetes client")]
    Client(#[source] kube::Error),

    #[error("Kubernetes API server is unreachable")]
    Unreachable(#[source] kube::Error),
}

/// Authenticates against the configured cluster and checks the connection by
/// asking the API server for its version.
pub async fn create_client(cluster: &ClusterConfig) -> Result<Client, AuthError> {
    let kubeconfig = match cluster {
        ClusterConfig::Eks(eks) => eks_kubeconfig(eks).await?,
        ClusterConfig::Kubeconfig(source) => {
            info!("Loading pre-configured kubeconfig");
            load_kubeconfig(source)?
        }
    };

    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(AuthError::Kubeconfig)?;
    let client = Client::try_from(config).map_err(AuthError::Client)?;

    let api_server_info = client
        .apiserver_version()
        .await
        .map_err(AuthError::Unreachable)?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

async fn eks_kubeconfig(eks: &EksConfig) -> Result<Kubeconfig, AuthError> {
    let sdk_config = eks::load_sdk_config(eks).await;
    let endpoint = eks::describe_cluster(&sdk_config, &eks.cluster_name).await?;
    let token = eks::generate_token(&sdk_config, &endpoint.name).await?;
    info!(
        "Generated token for EKS cluster {} at {}",
        endpoint.name, endpoint.endpoint
    );
    kubeconfig_for_endpoint(&endpoint, &token)
}

/// Turns the EKS endpoint, trust anchor and bearer token into a single
/// context kubeconfig, so both cluster variants share one client path.
pub fn kubeconfig_for_endpoint(
    endpoint: &ClusterEndpoint,
    token: &SecretString,
) -> Result<Kubeconfig, AuthError> {
    endpoint.decode_certificate_authority()?;

    let name = &endpoint.name;
    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": name,
            "cluster": {
                "server": endpoint.endpoint,
                "certificate-authority-data": endpoint.certificate_authority_data.trim(),
            }
        }],
        "users": [{
            "name": name,
            "user": { "token": token.expose_secret() }
        }],
        "contexts": [{
            "name": name,
            "context": { "cluster": name, "user": name }
        }],
        "current-context": name,
    });

    Kubeconfig::from_yaml(&document.to_string()).map_err(AuthError::Kubeconfig)
}

pub fn load_kubeconfig(source: &KubeconfigSource) -> Result<Kubeconfig, AuthError> {
    let blob = match source {
        KubeconfigSource::Path(path) => SecretString::new(
            fs::read_to_string(path).map_err(|e| AuthError::ReadKubeconfig(path.clone(), e))?,
        ),
        KubeconfigSource::Inline(blob) => blob.clone(),
    };
    parse_kubeconfig(&blob)
}

fn parse_kubeconfig(blob: &SecretString) -> Result<Kubeconfig, AuthError> {
    if blob.is_empty() {
        return Err(AuthError::EmptyKubeconfig);
    }
    let kubeconfig = Kubeconfig::from_yaml(blob.expose_secret()).map_err(AuthError::Kubeconfig)?;
    if kubeconfig.clusters.is_empty() {
        return Err(AuthError::EmptyKubeconfig);
    }
    Ok(kubeconfig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;

    static DOKS_KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- cluster:
    certificate-authority-data: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0t
    server: https://1234-abcd.k8s.ondigitalocean.com
  name: do-nyc1-hello-doks
contexts:
- context:
    cluster: do-nyc1-hello-doks
    user: do-nyc1-hello-doks-admin
  name: do-nyc1-hello-doks
current-context: do-nyc1-hello-doks
users:
- name: do-nyc1-hello-doks-admin
  user:
    token: dop_v1_example
"#;

    fn endpoint() -> ClusterEndpoint {
        ClusterEndpoint {
            name: "hello-eks".to_string(),
            endpoint: "https://ABCDEF.gr7.us-east-1.eks.amazonaws.com".to_string(),
            certificate_authority_data: STANDARD.encode("-----BEGIN CERTIFICATE-----\n"),
        }
    }

    #[test]
    fn test_kubeconfig_for_endpoint() {
        let kubeconfig =
            kubeconfig_for_endpoint(&endpoint(), &SecretString::new("k8s-aws-v1.abc")).unwrap();

        assert_eq!(kubeconfig.current_context.as_deref(), Some("hello-eks"));
        assert_eq!(kubeconfig.clusters.len(), 1);
        let cluster = kubeconfig.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(
            cluster.server.as_deref(),
            Some("https://ABCDEF.gr7.us-east-1.eks.amazonaws.com")
        );
        assert_eq!(
            cluster.certificate_authority_data.as_deref(),
            Some(endpoint().certificate_authority_data.as_str())
        );
        assert_eq!(kubeconfig.auth_infos.len(), 1);
        assert!(kubeconfig.auth_infos[0].auth_info.as_ref().unwrap().token.is_some());
    }

    #[test]
    fn test_kubeconfig_for_endpoint_rejects_bad_certificate() {
        let mut endpoint = endpoint();
        endpoint.certificate_authority_data = "%%%".to_string();

        let err = kubeconfig_for_endpoint(&endpoint, &SecretString::new("token")).unwrap_err();
        assert!(matches!(err, AuthError::CertificateDecode(..)));
    }

    #[test]
    fn test_load_inline_kubeconfig() {
        let kubeconfig =
            load_kubeconfig(&KubeconfigSource::Inline(SecretString::new(DOKS_KUBECONFIG)))
                .unwrap();
        assert_eq!(
            kubeconfig.current_context.as_deref(),
            Some("do-nyc1-hello-doks")
        );
        assert_eq!(kubeconfig.clusters[0].name, "do-nyc1-hello-doks");
    }

    #[test]
    fn test_load_kubeconfig_from_file() {
        let tmp_file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
        fs::write(tmp_file.path(), DOKS_KUBECONFIG).expect("Failed to write to temp file");

        let kubeconfig =
            load_kubeconfig(&KubeconfigSource::Path(tmp_file.path().to_path_buf())).unwrap();
        assert_eq!(kubeconfig.auth_infos.len(), 1);
    }

    #[test]
    fn test_empty_or_malformed_kubeconfig_fails() {
        assert!(matches!(
            load_kubeconfig(&KubeconfigSource::Inline(SecretString::new("  "))),
            Err(AuthError::EmptyKubeconfig)
        ));
        assert!(matches!(
            load_kubeconfig(&KubeconfigSource::Inline(SecretString::new("clusters: [[["))),
            Err(AuthError::Kubeconfig(_))
        ));
        assert!(matches!(
            load_kubeconfig(&KubeconfigSource::Path(PathBuf::from(
                "/nonexistent/kubeconfig"
            ))),
            Err(AuthError::ReadKubeconfig(..))
        ));
    }
}
