use crate::cluster::AuthError;
use crate::config::EksConfig;
use crate::secret_string::SecretString;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::Credentials;
use aws_credential_types::provider::ProvideCredentials;
use aws_sdk_eks::error::DisplayErrorContext;
use aws_sigv4::http_request::{
    SignableBody, SignableRequest, SignatureLocation, SigningParams, SigningSettings, sign,
};
use aws_sigv4::sign::v4;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};
use url::Url;

static TOKEN_PREFIX: &str = "k8s-aws-v1.";
static CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";
// aws-iam-authenticator rejects presigned URLs valid for longer than this
static TOKEN_URL_EXPIRY: Duration = Duration::from_secs(60);

/// What `DescribeCluster` tells us about a cluster's API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEndpoint {
    pub name: String,
    pub endpoint: String,
    /// Base64 encoded PEM bundle, as returned by the EKS API
    pub certificate_authority_data: String,
}

impl ClusterEndpoint {
    /// Decodes the trust anchor, failing on anything that is not base64.
    pub fn decode_certificate_authority(&self) -> Result<Vec<u8>, AuthError> {
        let decoded = STANDARD
            .decode(self.certificate_authority_data.trim())
            .map_err(|e| AuthError::CertificateDecode(self.name.clone(), e))?;
        if decoded.is_empty() {
            return Err(AuthError::IncompleteCluster(
                self.name.clone(),
                "certificate authority data",
            ));
        }
        Ok(decoded)
    }
}

pub async fn load_sdk_config(eks: &EksConfig) -> SdkConfig {
    aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(eks.region.clone()))
        .load()
        .await
}

pub async fn describe_cluster(
    sdk_config: &SdkConfig,
    cluster_name: &str,
) -> Result<ClusterEndpoint, AuthError> {
    info!("Describing EKS cluster {}", cluster_name);
    let client = aws_sdk_eks::Client::new(sdk_config);
    let output = client
        .describe_cluster()
        .name(cluster_name)
        .send()
        .await
        .map_err(|e| {
            AuthError::DescribeCluster(cluster_name.to_string(), DisplayErrorContext(e).to_string())
        })?;

    let missing = |what| AuthError::IncompleteCluster(cluster_name.to_string(), what);
    let cluster = output.cluster().ok_or_else(|| missing("cluster"))?;
    let endpoint = cluster.endpoint().ok_or_else(|| missing("endpoint"))?;
    let certificate_authority_data = cluster
        .certificate_authority()
        .and_then(|ca| ca.data())
        .ok_or_else(|| missing("certificate authority data"))?;

    Ok(ClusterEndpoint {
        name: cluster.name().unwrap_or(cluster_name).to_string(),
        endpoint: endpoint.to_string(),
        certificate_authority_data: certificate_authority_data.to_string(),
    })
}

/// Generates a bearer token the cluster's IAM authenticator accepts: a
/// presigned STS `GetCallerIdentity` URL bound to the cluster name.
pub async fn generate_token(
    sdk_config: &SdkConfig,
    cluster_name: &str,
) -> Result<SecretString, AuthError> {
    let token_error = |message: String| AuthError::Token(cluster_name.to_string(), message);

    let provider = sdk_config
        .credentials_provider()
        .ok_or_else(|| token_error("no AWS credentials provider configured".to_string()))?;
    let credentials = provider
        .provide_credentials()
        .await
        .map_err(|e| token_error(e.to_string()))?;
    let region = sdk_config
        .region()
        .map(|r| r.as_ref().to_string())
        .ok_or_else(|| token_error("no AWS region configured".to_string()))?;

    let url = presign_caller_identity(credentials, &region, cluster_name, SystemTime::now())?;
    debug!("Presigned STS request for cluster {} in {}", cluster_name, region);
    Ok(encode_token(&url))
}

fn presign_caller_identity(
    credentials: Credentials,
    region: &str,
    cluster_name: &str,
    time: SystemTime,
) -> Result<Url, AuthError> {
    let token_error = |message: String| AuthError::Token(cluster_name.to_string(), message);

    let mut url = Url::parse(&format!(
        "https://sts.{}.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15",
        region
    ))
    .map_err(|e| token_error(e.to_string()))?;

    let mut settings = SigningSettings::default();
    settings.signature_location = SignatureLocation::QueryParams;
    settings.expires_in = Some(TOKEN_URL_EXPIRY);

    let identity = credentials.into();
    let signing_params: SigningParams<'_> = v4::SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name("sts")
        .time(time)
        .settings(settings)
        .build()
        .map_err(|e| token_error(e.to_string()))?
        .into();

    let request = SignableRequest::new(
        "GET",
        url.as_str(),
        std::iter::once((CLUSTER_ID_HEADER, cluster_name)),
        SignableBody::Bytes(&[]),
    )
    .map_err(|e| token_error(e.to_string()))?;

    let (instructions, _signature) = sign(request, &signing_params)
        .map_err(|e| token_error(e.to_string()))?
        .into_parts();

    {
        let mut query = url.query_pairs_mut();
        for (name, value) in instructions.params() {
            query.append_pair(name, value);
        }
    }
    Ok(url)
}

fn encode_token(url: &Url) -> SecretString {
    SecretString::new(format!("{}{}", TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(url.as_str())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn presign() -> Url {
        let credentials = Credentials::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            None,
            None,
            "test",
        );
        presign_caller_identity(
            credentials,
            "us-east-1",
            "hello-eks",
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        )
        .expect("presigning should succeed")
    }

    #[test]
    fn test_presigned_url_targets_regional_sts() {
        let url = presign();
        assert_eq!(url.host_str(), Some("sts.us-east-1.amazonaws.com"));

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("Action").map(String::as_str), Some("GetCallerIdentity"));
        assert_eq!(query.get("X-Amz-Expires").map(String::as_str), Some("60"));
        assert!(query.contains_key("X-Amz-Signature"));
        assert!(
            query
                .get("X-Amz-SignedHeaders")
                .is_some_and(|headers| headers.split(';').any(|h| h == CLUSTER_ID_HEADER))
        );
        assert!(
            query
                .get("X-Amz-Credential")
                .is_some_and(|c| c.starts_with("AKIDEXAMPLE/20231114/us-east-1/sts/"))
        );
    }

    #[test]
    fn test_token_is_prefixed_unpadded_base64url() {
        let url = presign();
        let token = encode_token(&url);
        let encoded = token
            .expose_secret()
            .strip_prefix(TOKEN_PREFIX)
            .expect("token should carry the k8s-aws-v1 prefix");

        assert!(!encoded.contains('='));
        assert!(!encoded.contains('+') && !encoded.contains('/'));
        let decoded = URL_SAFE_NO_PAD.decode(encoded).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), url.as_str());
    }

    #[test]
    fn test_certificate_authority_must_be_base64() {
        let mut endpoint = ClusterEndpoint {
            name: "hello-eks".to_string(),
            endpoint: "https://ABCDEF.gr7.us-east-1.eks.amazonaws.com".to_string(),
            certificate_authority_data: STANDARD.encode("-----BEGIN CERTIFICATE-----"),
        };
        assert_eq!(
            endpoint.decode_certificate_authority().unwrap(),
            b"-----BEGIN CERTIFICATE-----"
        );

        endpoint.certificate_authority_data = "not base64!".to_string();
        assert!(matches!(
            endpoint.decode_certificate_authority(),
            Err(AuthError::CertificateDecode(..))
        ));

        endpoint.certificate_authority_data = String::new();
        assert!(matches!(
            endpoint.decode_certificate_authority(),
            Err(AuthError::IncompleteCluster(..))
        ));
    }
}
