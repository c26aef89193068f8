//! Container image references
//!
//! Parses references of the form `[registry/]repository[:tag][@digest]` and
//! renders them fully qualified for the executor.

use crate::error::ValidationError;

/// Registry used when the default registry is Docker Hub
pub const DOCKER_HUB: &str = "docker.io";

const DEFAULT_TAG: &str = "latest";
const MAX_TAG_LEN: usize = 128;

/// A parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parses an image reference
    pub fn parse(reference: &str) -> Result<Self, ValidationError> {
        let invalid = |reason| ValidationError::InvalidImage {
            reference: reference.to_string(),
            reason,
        };

        if reference.is_empty() {
            return Err(invalid("reference cannot be empty"));
        }

        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("reference cannot contain whitespace"));
        }

        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => {
                match digest.split_once(':') {
                    Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => {}
                    _ => return Err(invalid("digest must be of the form algorithm:hex")),
                }
                (rest, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A ':' after the last '/' separates the tag; before it, a registry port.
        let last_slash = rest.rfind('/');
        let (path, tag) = match rest.rfind(':') {
            Some(idx) if last_slash.is_none_or(|slash| idx > slash) => {
                let tag = &rest[idx + 1..];
                if tag.is_empty() {
                    return Err(invalid("tag cannot be empty"));
                }
                if tag.len() > MAX_TAG_LEN {
                    return Err(invalid("tag is too long (max 128 characters)"));
                }
                if !tag
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
                {
                    return Err(invalid("tag contains invalid characters"));
                }
                (&rest[..idx], Some(tag.to_string()))
            }
            _ => (rest, None),
        };

        let mut components: Vec<&str> = path.split('/').collect();
        let registry = if components.len() > 1 && is_registry(components[0]) {
            Some(components.remove(0).to_string())
        } else {
            None
        };

        if components.iter().any(|c| c.is_empty()) {
            return Err(invalid("repository path has an empty component"));
        }

        if !components.iter().all(|c| {
            c.chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || matches!(ch, '.' | '_' | '-'))
        }) {
            return Err(invalid(
                "repository may only contain lowercase letters, digits, '.', '_' and '-'",
            ));
        }

        Ok(Self {
            registry,
            repository: components.join("/"),
            tag,
            digest,
        })
    }

    /// Renders the reference with registry and tag filled in
    ///
    /// Single-component repositories on Docker Hub live under `library/`.
    /// A reference with neither tag nor digest is pinned to `latest`.
    pub fn qualified(&self, default_registry: &str) -> String {
        let registry = self.registry.as_deref().unwrap_or(default_registry);
        let repository = if self.registry.is_none()
            && registry == DOCKER_HUB
            && !self.repository.contains('/')
        {
            format!("library/{}", self.repository)
        } else {
            self.repository.clone()
        };

        let mut qualified = format!("{}/{}", registry, repository);
        match (&self.tag, &self.digest) {
            (Some(tag), _) => {
                qualified.push(':');
                qualified.push_str(tag);
            }
            (None, None) => {
                qualified.push(':');
                qualified.push_str(DEFAULT_TAG);
            }
            (None, Some(_)) => {}
        }
        if let Some(digest) = &self.digest {
            qualified.push('@');
            qualified.push_str(digest);
        }
        qualified
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        write!(f, "{}", self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

fn is_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}
