use crate::config::RegistryCredentials;
use crate::image_reference::ImageReference;
use anyhow::{Context, Result};
use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

static MANIFEST_MEDIA_TYPES: &str = "application/vnd.oci.image.index.v1+json, application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.list.v2+json, application/vnd.docker.distribution.manifest.v2+json";

pub fn create_client() -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    Client::builder()
        .build()
        .context("Failed to build HTTP client")
}

/// Docker Hub serves its registry API from a different host than the one
/// used in image references.
fn api_host(registry: &str) -> &str {
    match registry {
        "docker.io" | "index.docker.io" => "registry-1.docker.io",
        other => other,
    }
}

pub fn manifest_url(image_reference: &ImageReference) -> String {
    let reference = image_reference.tag.as_deref().unwrap_or("latest");
    format!(
        "https://{}/v2/{}/manifests/{}",
        api_host(&image_reference.registry),
        image_reference.repository,
        reference
    )
}

/// Asks the registry which manifest digest the reference's tag points at.
pub async fn fetch_digest_from_tag(
    image_reference: &ImageReference,
    credentials: Option<&RegistryCredentials>,
    client: &Client,
) -> Result<String> {
    let url = manifest_url(image_reference);
    let response = fetch_manifest(client, image_reference, credentials, &url).await?;
    let digest = get_digest_from_response(&response)?;

    info!("Registry reports digest {} for {}", digest, image_reference);

    Ok(digest)
}

async fn fetch_manifest(
    client: &Client,
    image_reference: &ImageReference,
    credentials: Option<&RegistryCredentials>,
    url: &str,
) -> Result<Response> {
    info!("Fetching image manifest from URL {}", url);
    let response = client
        .get(url)
        .header(ACCEPT, MANIFEST_MEDIA_TYPES)
        .send()
        .await
        .context("Failed to send request to fetch manifest")?;

    let response = if response.status() == StatusCode::UNAUTHORIZED {
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_challenge)
            .with_context(|| {
                format!(
                    "Registry {} requires authentication but sent no usable challenge",
                    image_reference.registry
                )
            })?;
        let request = client.get(url).header(ACCEPT, MANIFEST_MEDIA_TYPES);
        let request = match challenge {
            Challenge::Bearer(challenge) => {
                let token =
                    fetch_bearer_token(client, &challenge, image_reference, credentials).await?;
                request.bearer_auth(token)
            }
            Challenge::Basic => {
                let credentials = credentials.with_context(|| {
                    format!(
                        "Registry {} requires basic authentication but no credentials are configured",
                        image_reference.registry
                    )
                })?;
                let (username, password) = basic_auth_pair(credentials);
                request.basic_auth(username, Some(password))
            }
        };
        request
            .send()
            .await
            .context("Failed to send authenticated request to fetch manifest")?
    } else {
        response
    };

    if !response.status().is_success() {
        anyhow::bail!(
            "Registry {} returned error status {} while fetching image manifest",
            image_reference.registry,
            response.status()
        );
    }
    Ok(response)
}

#[derive(Debug, PartialEq, Eq)]
enum Challenge {
    Bearer(BearerChallenge),
    Basic,
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Parses a `WWW-Authenticate` header such as
/// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io"`.
fn parse_challenge(header: &str) -> Option<Challenge> {
    let (scheme, params) = header.trim().split_once(' ').unwrap_or((header.trim(), ""));
    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let re = Regex::new(r#"(\w+)="([^"]*)""#).ok()?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for caps in re.captures_iter(params) {
        let value = caps[2].to_string();
        match caps[1].to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Some(Challenge::Bearer(BearerChallenge {
        realm: realm?,
        service,
        scope,
    }))
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Exchanges the configured credentials (or nothing, for public images) for
/// a pull token at the challenge's realm.
async fn fetch_bearer_token(
    client: &Client,
    challenge: &BearerChallenge,
    image_reference: &ImageReference,
    credentials: Option<&RegistryCredentials>,
) -> Result<String> {
    let scope = challenge
        .scope
        .clone()
        .unwrap_or_else(|| format!("repository:{}:pull", image_reference.repository));
    let mut query = vec![("scope", scope)];
    if let Some(service) = &challenge.service {
        query.push(("service", service.clone()));
    }

    debug!("Requesting registry token from {}", challenge.realm);
    let mut request = client.get(&challenge.realm).query(&query);
    if let Some(credentials) = credentials {
        let (username, password) = basic_auth_pair(credentials);
        request = request.basic_auth(username, Some(password));
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("Failed to request registry token from {}", challenge.realm))?;
    if !response.status().is_success() {
        anyhow::bail!(
            "Token endpoint {} returned error status {}",
            challenge.realm,
            response.status()
        );
    }

    let body: TokenResponse = response
        .json()
        .await
        .context("Failed to decode registry token response")?;
    body.token
        .or(body.access_token)
        .context("Registry token response contains no token")
}

/// Registries that issue plain API tokens (DigitalOcean) accept the token as
/// both user name and password.
fn basic_auth_pair(credentials: &RegistryCredentials) -> (&str, &str) {
    let token = credentials.token.expose_secret();
    (credentials.username.as_deref().unwrap_or(token), token)
}

fn get_digest_from_response(response: &Response) -> Result<String> {
    Ok(response
        .headers()
        .get("Docker-Content-Digest")
        .context("Response does not contain HTTP header Docker-Content-Digest")?
        .to_str()
        .context("Received invalid UTF-8 content in Docker-Content-Digest header")?
        .to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_string::SecretString;

    #[test]
    fn test_manifest_url_for_docker_hub() {
        let reference = ImageReference::parse("kylepenfound/hello-eks:latest").unwrap();
        assert_eq!(
            manifest_url(&reference),
            "https://registry-1.docker.io/v2/kylepenfound/hello-eks/manifests/latest"
        );
    }

    #[test]
    fn test_manifest_url_for_private_registry() {
        let reference =
            ImageReference::parse("registry.digitalocean.com/hello/hello-doks:v2").unwrap();
        assert_eq!(
            manifest_url(&reference),
            "https://registry.digitalocean.com/v2/hello/hello-doks/manifests/v2"
        );
    }

    #[test]
    fn test_parse_docker_hub_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:kylepenfound/hello-eks:pull""#;
        assert_eq!(
            parse_challenge(header),
            Some(Challenge::Bearer(BearerChallenge {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:kylepenfound/hello-eks:pull".to_string()),
            }))
        );
    }

    #[test]
    fn test_parse_challenge_without_scope() {
        let header = r#"bearer realm="https://api.digitalocean.com/v2/registry/auth",service="registry.digitalocean.com""#;
        match parse_challenge(header) {
            Some(Challenge::Bearer(challenge)) => {
                assert_eq!(challenge.realm, "https://api.digitalocean.com/v2/registry/auth");
                assert_eq!(challenge.scope, None);
            }
            other => panic!("expected bearer challenge, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_basic_and_unknown_challenges() {
        assert_eq!(
            parse_challenge(r#"Basic realm="registry.example.com""#),
            Some(Challenge::Basic)
        );
        assert_eq!(parse_challenge(r#"Bearer service="registry.docker.io""#), None);
        assert_eq!(parse_challenge("Negotiate"), None);
    }

    #[test]
    fn test_basic_auth_pair_falls_back_to_token() {
        let with_user = RegistryCredentials {
            username: Some("kylepenfound".to_string()),
            token: SecretString::new("dckr_pat_example".to_string()),
        };
        assert_eq!(basic_auth_pair(&with_user), ("kylepenfound", "dckr_pat_example"));

        let token_only = RegistryCredentials {
            username: None,
            token: SecretString::new("dop_v1_example".to_string()),
        };
        assert_eq!(basic_auth_pair(&token_only), ("dop_v1_example", "dop_v1_example"));
    }
}
