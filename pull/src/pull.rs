//! Pull orchestration.
//!
//! Sequences one pull operation: auth probe, manifest resolution, config
//! and layer fetches, and final packing. Layer downloads run with bounded
//! concurrency; packing is strictly serial in manifest order because each
//! chain ID depends on the previous one.

use std::path::Path;

use futures::stream::{self, StreamExt};
use reqwest::Client;
use wharf_core::config::{Credentials, PullConfig};
use wharf_core::error::{PullError, Result};

use crate::auth::AuthSession;
use crate::blob::{BlobFetcher, FetchedBlob};
use crate::digest::Digest;
use crate::manifest;
use crate::pack::{ImagePacker, PackedImage};
use crate::reference::ImageReference;

/// Pulls one image per call. Credentials and configuration are read-only
/// for the lifetime of each operation.
pub struct ImagePuller {
    credentials: Option<Credentials>,
    config: PullConfig,
}

impl ImagePuller {
    pub fn new(credentials: Option<Credentials>, config: PullConfig) -> Self {
        Self {
            credentials,
            config,
        }
    }

    /// Pull `reference` and write a loadable tarball to `output_path`.
    ///
    /// Any stage failure aborts the pull: in-flight layer downloads are
    /// cancelled, temp files are cleaned up, and nothing is left at
    /// `output_path`.
    pub async fn pull(
        &self,
        reference: &ImageReference,
        output_path: &Path,
    ) -> Result<PackedImage> {
        let platform = self.config.target_platform();

        tracing::info!(
            reference = %reference,
            platform = %platform,
            output = %output_path.display(),
            "Pulling image"
        );

        let client = self.http_client()?;
        let session = AuthSession::establish(
            &client,
            reference,
            self.credentials.clone(),
            self.config.hostname.clone(),
        )
        .await?;

        let resolved = manifest::resolve(&session, reference, &platform).await?;
        tracing::info!(
            reference = %reference,
            digest = %resolved.digest,
            layers = resolved.manifest.layers.len(),
            "Resolved manifest"
        );

        let fetcher = BlobFetcher::new(&session, reference, self.config.blob_retries);

        let config_digest = resolved.manifest.config.digest()?;
        let config_blob = fetcher.fetch(&config_digest).await?;
        let config_bytes = config_blob.read_bytes()?;

        let layers = self.fetch_layers(&fetcher, &resolved.manifest).await?;

        let packed = ImagePacker::new(reference).pack(
            &resolved.manifest,
            &config_bytes,
            &layers,
            output_path,
        )?;

        tracing::info!(
            reference = %reference,
            path = %packed.path.display(),
            "Pull complete"
        );

        Ok(packed)
    }

    /// Download all layer blobs with bounded concurrency, returning them
    /// in manifest order regardless of completion order.
    async fn fetch_layers(
        &self,
        fetcher: &BlobFetcher<'_>,
        manifest: &manifest::ImageManifest,
    ) -> Result<Vec<FetchedBlob>> {
        let digests = manifest
            .layers
            .iter()
            .map(|layer| layer.digest())
            .collect::<Result<Vec<Digest>>>()?;

        let total = digests.len();
        let mut slots: Vec<Option<FetchedBlob>> = (0..total).map(|_| None).collect();

        let mut downloads = stream::iter(digests.into_iter().enumerate().map(
            |(index, digest)| async move {
                let blob = fetcher.fetch(&digest).await?;
                Ok::<_, PullError>((index, blob))
            },
        ))
        .buffer_unordered(self.config.max_concurrent_layers.max(1));

        while let Some(result) = downloads.next().await {
            // The first failure drops the stream, cancelling in-flight
            // sibling downloads; their temp files go with them.
            let (index, blob) = result?;
            tracing::info!(
                layer = index + 1,
                total,
                digest = %blob.digest(),
                size = blob.size(),
                "Fetched layer"
            );
            slots[index] = Some(blob);
        }
        drop(downloads);

        Ok(slots.into_iter().flatten().collect())
    }

    fn http_client(&self) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout);

        if self.config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }

        builder
            .build()
            .map_err(|e| PullError::Network(format!("build HTTP client: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_puller_creation() {
        let _puller = ImagePuller::new(Some(Credentials::harbor_default()), PullConfig::default());
    }

    #[test]
    fn test_http_client_builds() {
        let puller = ImagePuller::new(None, PullConfig::default());
        assert!(puller.http_client().is_ok());
    }

    #[test]
    fn test_http_client_builds_insecure() {
        let puller = ImagePuller::new(
            None,
            PullConfig {
                insecure: true,
                ..Default::default()
            },
        );
        assert!(puller.http_client().is_ok());
    }
}
