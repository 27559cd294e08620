//! Blob fetching.
//!
//! Streams config and layer blobs by digest, hashing incrementally and
//! verifying on completion. Blobs spill to temp files, never to memory.

use std::io::Write;
use std::path::Path;

use futures::StreamExt;
use tempfile::NamedTempFile;
use wharf_core::error::{PullError, Result};

use crate::auth::AuthSession;
use crate::digest::{Digest, DigestHasher};
use crate::reference::ImageReference;

/// Base delay between retry attempts; doubles per attempt.
const RETRY_BASE_DELAY_MS: u64 = 500;

/// A downloaded, digest-verified blob spilled to a temp file.
///
/// The temp file is removed when the blob is dropped, so an aborted pull
/// leaves nothing behind.
#[derive(Debug)]
pub struct FetchedBlob {
    digest: Digest,
    size: u64,
    file: NamedTempFile,
}

impl FetchedBlob {
    /// Wrap an already-verified temp file.
    pub fn from_parts(digest: Digest, file: NamedTempFile) -> Result<Self> {
        let size = file.as_file().metadata()?.len();
        Ok(Self { digest, size, file })
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Read the whole blob into memory. Intended for config blobs only;
    /// layers stay on disk.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.path())?)
    }
}

/// An error from a single fetch attempt, tagged with whether the retry
/// policy applies to it.
struct AttemptError {
    error: PullError,
    transient: bool,
}

impl AttemptError {
    fn transient(error: PullError) -> Self {
        Self {
            error,
            transient: true,
        }
    }

    fn fatal(error: PullError) -> Self {
        Self {
            error,
            transient: false,
        }
    }
}

/// Streams blobs for one repository, retrying transient failures.
pub struct BlobFetcher<'a> {
    session: &'a AuthSession,
    reference: &'a ImageReference,
    retries: u32,
}

impl<'a> BlobFetcher<'a> {
    pub fn new(session: &'a AuthSession, reference: &'a ImageReference, retries: u32) -> Self {
        Self {
            session,
            reference,
            retries,
        }
    }

    /// Fetch a blob by digest, verifying the content hash on completion.
    ///
    /// Transient failures (connection errors, 5xx) are retried up to the
    /// configured bound with doubling backoff. Every attempt starts over
    /// on a fresh temp file, so a reset mid-body never leaves duplicate
    /// bytes in the output. 4xx responses and digest mismatches are not
    /// retried.
    pub async fn fetch(&self, digest: &Digest) -> Result<FetchedBlob> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_fetch(digest).await {
                Ok(blob) => return Ok(blob),
                Err(AttemptError {
                    error,
                    transient: true,
                }) if attempt <= self.retries => {
                    let delay = retry_delay(attempt);
                    tracing::warn!(
                        digest = %digest,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient blob fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError { error, .. }) => return Err(error),
            }
        }
    }

    async fn try_fetch(&self, digest: &Digest) -> std::result::Result<FetchedBlob, AttemptError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.reference.registry_base(),
            self.reference.repository,
            digest
        );

        let response = self
            .session
            .send_authorized(|| self.session.client().get(&url))
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let error = PullError::Network(format!(
                "blob {} for {} returned {}",
                digest,
                self.reference,
                status.as_u16()
            ));
            // 5xx is worth another attempt; 4xx is the registry's answer.
            return Err(if status.is_server_error() {
                AttemptError::transient(error)
            } else {
                AttemptError::fatal(error)
            });
        }

        let mut file = NamedTempFile::new()
            .map_err(|e| AttemptError::fatal(PullError::Io(e)))?;
        let mut hasher = DigestHasher::new(digest.algorithm());
        let mut size = 0u64;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                AttemptError::transient(PullError::Network(format!(
                    "blob {} body interrupted: {}",
                    digest, e
                )))
            })?;
            hasher.update(&chunk);
            file.write_all(&chunk)
                .map_err(|e| AttemptError::fatal(PullError::Io(e)))?;
            size += chunk.len() as u64;
        }

        file.flush()
            .map_err(|e| AttemptError::fatal(PullError::Io(e)))?;

        let actual = hasher.finalize();
        if actual != *digest {
            // Partial or corrupted content; the temp file dies with this
            // scope and is never handed to the packer.
            return Err(AttemptError::fatal(PullError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            }));
        }

        tracing::debug!(digest = %digest, size, "Fetched blob");

        Ok(FetchedBlob {
            digest: digest.clone(),
            size,
            file,
        })
    }
}

/// Errors from the request path: transport failures are transient, auth
/// failures are final.
fn classify_request_error(error: PullError) -> AttemptError {
    match error {
        PullError::Network(_) => AttemptError::transient(error),
        other => AttemptError::fatal(other),
    }
}

fn retry_delay(attempt: u32) -> std::time::Duration {
    std::time::Duration::from_millis(RETRY_BASE_DELAY_MS << (attempt - 1).min(4))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles() {
        assert_eq!(retry_delay(1).as_millis(), 500);
        assert_eq!(retry_delay(2).as_millis(), 1000);
        assert_eq!(retry_delay(3).as_millis(), 2000);
    }

    #[test]
    fn test_retry_delay_capped() {
        assert_eq!(retry_delay(10), retry_delay(5));
    }

    #[test]
    fn test_classify_network_error_transient() {
        let attempt = classify_request_error(PullError::Network("reset".to_string()));
        assert!(attempt.transient);
    }

    #[test]
    fn test_classify_auth_expired_fatal() {
        let attempt = classify_request_error(PullError::AuthExpired {
            registry: "registry.example.com".to_string(),
        });
        assert!(!attempt.transient);
    }

    #[test]
    fn test_fetched_blob_from_parts() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        file.flush().unwrap();

        let blob = FetchedBlob::from_parts(Digest::sha256_of(b"hello"), file).unwrap();
        assert_eq!(blob.size(), 5);
        assert_eq!(blob.read_bytes().unwrap(), b"hello");
    }

    #[test]
    fn test_fetched_blob_temp_file_removed_on_drop() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"data").unwrap();
        let blob = FetchedBlob::from_parts(Digest::sha256_of(b"data"), file).unwrap();
        let path = blob.path().to_path_buf();
        assert!(path.exists());
        drop(blob);
        assert!(!path.exists());
    }
}
