//! Image reference parsing.
//!
//! References name an image on a specific registry host:
//!
//! - `registry.example.com/project/app:1.0`
//! - `registry.example.com:8443/project/app@sha256:<hex>`
//!
//! Unlike Docker CLI references there is no implied default registry:
//! the host is always the first path component, and a reference with
//! fewer than three components is rejected.

use wharf_core::error::{PullError, Result};

use crate::digest::Digest;

/// Default tag when neither tag nor digest is given.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference. Exactly one of `tag`/`digest` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "registry.example.com")
    pub host: String,
    /// Registry port, when explicitly given
    pub port: Option<u16>,
    /// Repository path (e.g., "project/app", "project/app/name")
    pub repository: String,
    /// Tag (e.g., "latest", "1.0")
    pub tag: Option<String>,
    /// Content digest, for pinned pulls
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse a reference string.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();

        if reference.contains("://") {
            return Err(malformed(reference, "scheme prefix is not allowed"));
        }

        let parts: Vec<&str> = reference.split('/').collect();
        if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(malformed(
                reference,
                "expected <host>[:port]/<project>/<image>[:tag|@digest]",
            ));
        }

        let (host, port) = parse_host(reference, parts[0])?;
        let path = parts[1..].join("/");

        // Digest takes precedence over tag: everything after '@' must be
        // a valid <algorithm>:<hex> digest.
        if let Some((repository, digest_str)) = path.split_once('@') {
            if repository.is_empty() || repository.ends_with('/') {
                return Err(malformed(reference, "empty repository before digest"));
            }
            let digest = Digest::parse(digest_str)?;
            return Ok(Self {
                host,
                port,
                repository: repository.to_string(),
                tag: None,
                digest: Some(digest),
            });
        }

        // Tag is in the last path segment only; earlier segments never
        // contain ':' because the port was split off above.
        match path.rsplit_once(':') {
            Some((repository, tag)) => {
                if tag.is_empty() {
                    return Err(malformed(reference, "empty tag"));
                }
                Ok(Self {
                    host,
                    port,
                    repository: repository.to_string(),
                    tag: Some(tag.to_string()),
                    digest: None,
                })
            }
            None => Ok(Self {
                host,
                port,
                repository: path,
                tag: Some(DEFAULT_TAG.to_string()),
                digest: None,
            }),
        }
    }

    /// `https://host[:port]` base for Registry V2 API calls.
    pub fn registry_base(&self) -> String {
        format!("https://{}", self.registry())
    }

    /// `host[:port]` as written.
    pub fn registry(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.clone(),
        }
    }

    /// Tag or digest, as used in the manifest URL.
    pub fn api_reference(&self) -> String {
        match (&self.tag, &self.digest) {
            (_, Some(digest)) => digest.to_string(),
            (Some(tag), None) => tag.clone(),
            // unreachable by construction, but keep the URL valid
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Tag used in the output image metadata.
    ///
    /// Digest pulls get a `sha256-<hex>` pseudo-tag, since a raw digest
    /// is not a legal tag for the image loader.
    pub fn output_tag(&self) -> String {
        match (&self.tag, &self.digest) {
            (Some(tag), _) => tag.clone(),
            (None, Some(digest)) => format!("{}-{}", digest.algorithm().name(), digest.hex()),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// `repository:tag` string for the packed image's RepoTags entry.
    pub fn repo_tag(&self) -> String {
        format!("{}:{}", self.repository, self.output_tag())
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry(), self.repository)?;
        if let Some(ref digest) = self.digest {
            write!(f, "@{}", digest)
        } else if let Some(ref tag) = self.tag {
            write!(f, ":{}", tag)
        } else {
            Ok(())
        }
    }
}

fn parse_host(reference: &str, host_part: &str) -> Result<(String, Option<u16>)> {
    match host_part.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| malformed(reference, "invalid registry port"))?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((host_part.to_string(), None)),
    }
}

fn malformed(reference: &str, message: &str) -> PullError {
    PullError::MalformedReference {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}
