use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DeployerError, Result};

/// Reference to a container image. The digest form is preferred whenever a
/// digest is known; the tag form is a fallback for freshly built images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| DeployerError::InvalidImageRef {
            reference: raw.to_string(),
            reason: reason.to_string(),
        };

        let (registry, rest) = raw
            .split_once('/')
            .ok_or_else(|| invalid("missing registry component"))?;
        if registry.is_empty() || rest.is_empty() {
            return Err(invalid("missing registry or repository"));
        }

        if let Some((repository, digest)) = rest.split_once('@') {
            if !digest.starts_with("sha256:") {
                return Err(invalid("digest must use the sha256: prefix"));
            }
            return Ok(Self {
                registry: registry.to_string(),
                repository: repository.to_string(),
                tag: None,
                digest: Some(digest.to_string()),
            });
        }

        // A colon after the last slash separates the tag; earlier colons
        // belong to the registry port.
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), Some(tag.to_string())),
            _ => (rest.to_string(), None),
        };
        if repository.is_empty() {
            return Err(invalid("empty repository"));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag,
            digest: None,
        })
    }

    /// Identifier used as the cache key component. Falls back to the tag
    /// form when no digest is present.
    pub fn cache_identity(&self) -> String {
        match &self.digest {
            Some(digest) => digest.clone(),
            None => self.to_string(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => write!(f, "{}/{}@{}", self.registry, self.repository, digest),
            (None, Some(tag)) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            (None, None) => write!(f, "{}/{}", self.registry, self.repository),
        }
    }
}
