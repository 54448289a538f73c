use std::fmt;

static DEFAULT_REGISTRY: &str = "docker.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug)]
pub enum ParseError {
    Empty,
    MissingRepository,
    MissingTag,
    InvalidDigest(String),
    InvalidFormat(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "image reference is empty"),
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::MissingTag => write!(f, "neither tag nor digest is present"),
            ParseError::InvalidDigest(digest) => write!(f, "invalid digest: {}", digest),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    /// Parses `[registry/]repository[:tag][@digest]`. References without a
    /// registry host resolve to Docker Hub, as the Docker CLI does.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.chars().any(char::is_whitespace) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let (without_digest, digest) = match s.split_once('@') {
            Some((before, digest)) => {
                validate_digest(digest)?;
                (before, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // A colon only starts a tag when it comes after the last slash,
        // otherwise it belongs to a registry port
        let (without_tag, tag) = match without_digest.rfind(':') {
            Some(pos) if pos > without_digest.rfind('/').unwrap_or(0) => {
                let tag = &without_digest[pos + 1..];
                if tag.is_empty() {
                    return Err(ParseError::InvalidFormat(s.to_string()));
                }
                (&without_digest[..pos], Some(tag.to_string()))
            }
            _ => (without_digest, None),
        };

        if tag.is_none() && digest.is_none() {
            return Err(ParseError::MissingTag);
        }

        let (registry, repository) = match without_tag.split_once('/') {
            Some((first, rest)) if is_registry_host(first) => (first.to_string(), rest.to_string()),
            Some(_) => (DEFAULT_REGISTRY.to_string(), without_tag.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", without_tag)),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(ParseError::MissingRepository);
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// `registry/repository` without tag or digest, as the engine expects it
    /// for commit and push.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    pub fn with_digest(&self, digest: &str) -> Result<Self, ParseError> {
        validate_digest(digest)?;
        Ok(Self {
            digest: Some(digest.to_string()),
            ..self.clone()
        })
    }
}

fn is_registry_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_digest(digest: &str) -> Result<(), ParseError> {
    match digest.split_once(':') {
        Some((algorithm, hex))
            if !algorithm.is_empty()
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            Ok(())
        }
        _ => Err(ParseError::InvalidDigest(digest.to_string())),
    }
}
