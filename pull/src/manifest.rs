//! Manifest resolution.
//!
//! Fetches a manifest or manifest list by reference and reduces it to a
//! single-platform image manifest. The manifest/list duality is a tagged
//! enum keyed on the response media type.

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use wharf_core::config::Platform;
use wharf_core::error::{PullError, Result};

use crate::auth::AuthSession;
use crate::digest::Digest;
use crate::reference::ImageReference;

pub const DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// Accept header value, most preferred first: lists before single-image
/// manifests, Docker types before their OCI equivalents.
pub fn accept_header() -> String {
    [
        DOCKER_MANIFEST_LIST,
        OCI_IMAGE_INDEX,
        DOCKER_MANIFEST_V2,
        OCI_IMAGE_MANIFEST,
    ]
    .join(", ")
}

/// A content descriptor: media type, digest, size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: Option<u64>,
}

impl Descriptor {
    /// Parse and validate the descriptor's digest.
    pub fn digest(&self) -> Result<Digest> {
        Digest::parse(&self.digest)
    }
}

/// A single-platform image manifest: config plus ordered layers.
///
/// Layer order is pull/apply order (bottom to top) and is preserved
/// verbatim through packing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Platform fields as they appear on a manifest-list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePlatform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// One entry of a manifest list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub platform: Option<WirePlatform>,
}

/// A multi-architecture manifest list (or OCI index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestList {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    pub manifests: Vec<ManifestEntry>,
}

impl ManifestList {
    /// Select the entry matching `platform`, if any.
    pub fn select(&self, platform: &Platform) -> Option<&ManifestEntry> {
        self.manifests.iter().find(|entry| {
            entry.platform.as_ref().is_some_and(|p| {
                p.os == platform.os && p.architecture == platform.architecture
            })
        })
    }
}

/// Decoded manifest response, tagged by media type.
#[derive(Debug, Clone)]
pub enum ManifestKind {
    Image(ImageManifest),
    List(ManifestList),
}

impl ManifestKind {
    /// Decode a manifest body according to its declared media type.
    pub fn decode(reference: &ImageReference, media_type: &str, body: &[u8]) -> Result<Self> {
        match media_type {
            DOCKER_MANIFEST_V2 | OCI_IMAGE_MANIFEST => {
                Ok(ManifestKind::Image(serde_json::from_slice(body)?))
            }
            DOCKER_MANIFEST_LIST | OCI_IMAGE_INDEX => {
                Ok(ManifestKind::List(serde_json::from_slice(body)?))
            }
            other => Err(PullError::UnsupportedMediaType {
                reference: reference.to_string(),
                media_type: other.to_string(),
            }),
        }
    }
}

/// The outcome of manifest resolution: a concrete image manifest and its
/// canonical digest.
///
/// For tag references the digest pins the manifest content against tag
/// mutation between the manifest fetch and the blob fetches.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub manifest: ImageManifest,
    pub digest: Digest,
    pub media_type: String,
}

/// Resolve `reference` to a single-platform image manifest.
///
/// A manifest list is reduced to the entry matching `platform` and that
/// entry's manifest is re-fetched by digest.
pub async fn resolve(
    session: &AuthSession,
    reference: &ImageReference,
    platform: &Platform,
) -> Result<ResolvedManifest> {
    let (kind, digest, media_type) =
        fetch_manifest(session, reference, &reference.api_reference()).await?;

    // If the reference was already digest-pinned, the body must hash to it.
    if let Some(ref pinned) = reference.digest {
        if digest != *pinned {
            return Err(PullError::DigestMismatch {
                expected: pinned.to_string(),
                actual: digest.to_string(),
            });
        }
    }

    match kind {
        ManifestKind::Image(manifest) => Ok(ResolvedManifest {
            manifest,
            digest,
            media_type,
        }),
        ManifestKind::List(list) => {
            let entry = list.select(platform).ok_or_else(|| {
                PullError::NoMatchingPlatform {
                    reference: reference.to_string(),
                    os: platform.os.clone(),
                    architecture: platform.architecture.clone(),
                }
            })?;

            let entry_digest = Digest::parse(&entry.digest)?;
            tracing::debug!(
                reference = %reference,
                platform = %platform,
                digest = %entry_digest,
                "Selected platform manifest from list"
            );

            let (kind, digest, media_type) =
                fetch_manifest(session, reference, &entry_digest.to_string()).await?;

            // The entry was addressed by digest, so the re-fetched body
            // must reproduce it.
            if digest != entry_digest {
                return Err(PullError::DigestMismatch {
                    expected: entry_digest.to_string(),
                    actual: digest.to_string(),
                });
            }

            match kind {
                ManifestKind::Image(manifest) => Ok(ResolvedManifest {
                    manifest,
                    digest,
                    media_type,
                }),
                ManifestKind::List(_) => Err(PullError::UnsupportedMediaType {
                    reference: reference.to_string(),
                    media_type: format!("{} (nested manifest list)", media_type),
                }),
            }
        }
    }
}

/// Fetch one manifest document and compute its canonical digest.
async fn fetch_manifest(
    session: &AuthSession,
    reference: &ImageReference,
    api_ref: &str,
) -> Result<(ManifestKind, Digest, String)> {
    let url = format!(
        "{}/v2/{}/manifests/{}",
        reference.registry_base(),
        reference.repository,
        api_ref
    );

    let response = session
        .send_authorized(|| session.client().get(&url).header(ACCEPT, accept_header()))
        .await?;

    let status = response.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(PullError::ManifestNotFound {
            reference: reference.to_string(),
        });
    }
    if !status.is_success() {
        return Err(PullError::Network(format!(
            "manifest request for {} returned {}",
            reference,
            status.as_u16()
        )));
    }

    let media_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .map(|s| s.split(';').next().unwrap_or(s).trim().to_string())
        .unwrap_or_default();

    let header_digest = response
        .headers()
        .get("docker-content-digest")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| Digest::parse(s).ok());

    let body = response
        .bytes()
        .await
        .map_err(|e| PullError::Network(format!("manifest body for {}: {}", reference, e)))?;

    // Canonical digest: trust the header when present, else hash the body.
    let digest = header_digest.unwrap_or_else(|| Digest::sha256_of(&body));

    let kind = ManifestKind::decode(reference, &media_type, &body)?;
    Ok((kind, digest, media_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference() -> ImageReference {
        ImageReference::parse("registry.example.com/lib/app:1.0").unwrap()
    }

    const MANIFEST_JSON: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": "sha256:1111111111111111111111111111111111111111111111111111111111111111",
            "size": 1469
        },
        "layers": [
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": "sha256:2222222222222222222222222222222222222222222222222222222222222222",
                "size": 2811478
            },
            {
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "digest": "sha256:3333333333333333333333333333333333333333333333333333333333333333",
                "size": 301
            }
        ]
    }"#;

    const LIST_JSON: &str = r#"{
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
        "manifests": [
            {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": "sha256:4444444444444444444444444444444444444444444444444444444444444444",
                "size": 528,
                "platform": { "os": "linux", "architecture": "amd64" }
            },
            {
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "digest": "sha256:5555555555555555555555555555555555555555555555555555555555555555",
                "size": 528,
                "platform": { "os": "linux", "architecture": "arm64", "variant": "v8" }
            }
        ]
    }"#;

    #[test]
    fn test_decode_image_manifest() {
        let kind =
            ManifestKind::decode(&reference(), DOCKER_MANIFEST_V2, MANIFEST_JSON.as_bytes())
                .unwrap();
        let manifest = match kind {
            ManifestKind::Image(m) => m,
            _ => panic!("expected image manifest"),
        };
        assert_eq!(manifest.schema_version, 2);
        assert_eq!(manifest.layers.len(), 2);
        assert!(manifest.layers[0].digest.starts_with("sha256:2222"));
    }

    #[test]
    fn test_decode_preserves_layer_order() {
        let kind =
            ManifestKind::decode(&reference(), OCI_IMAGE_MANIFEST, MANIFEST_JSON.as_bytes())
                .unwrap();
        if let ManifestKind::Image(m) = kind {
            let digests: Vec<&str> = m.layers.iter().map(|l| l.digest.as_str()).collect();
            assert!(digests[0] < digests[1], "order must follow the document");
        }
    }

    #[test]
    fn test_decode_manifest_list() {
        let kind =
            ManifestKind::decode(&reference(), DOCKER_MANIFEST_LIST, LIST_JSON.as_bytes())
                .unwrap();
        let list = match kind {
            ManifestKind::List(l) => l,
            _ => panic!("expected manifest list"),
        };
        assert_eq!(list.manifests.len(), 2);
    }

    #[test]
    fn test_decode_unsupported_media_type() {
        let err = ManifestKind::decode(
            &reference(),
            "application/vnd.docker.distribution.manifest.v1+json",
            b"{}",
        )
        .unwrap_err();
        assert!(matches!(err, PullError::UnsupportedMediaType { .. }));
    }

    #[test]
    fn test_select_platform_match() {
        let list: ManifestList = serde_json::from_str(LIST_JSON).unwrap();
        let entry = list.select(&Platform::new("linux", "amd64")).unwrap();
        assert!(entry.digest.starts_with("sha256:4444"));
    }

    #[test]
    fn test_select_platform_absent() {
        let list: ManifestList = serde_json::from_str(LIST_JSON).unwrap();
        assert!(list.select(&Platform::new("linux", "ppc64le")).is_none());
    }

    #[test]
    fn test_descriptor_digest_parse() {
        let manifest: ImageManifest = serde_json::from_str(MANIFEST_JSON).unwrap();
        let digest = manifest.config.digest().unwrap();
        assert_eq!(digest.hex(), "1".repeat(64));
    }

    #[test]
    fn test_accept_header_preference_order() {
        let accept = accept_header();
        let list_pos = accept.find(DOCKER_MANIFEST_LIST).unwrap();
        let v2_pos = accept.find(DOCKER_MANIFEST_V2).unwrap();
        assert!(list_pos < v2_pos, "lists must be preferred over manifests");
    }
}
