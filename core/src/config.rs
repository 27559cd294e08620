use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Registry credentials.
///
/// Always an explicit value: the default `admin`/`Harbor12345` pair is a
/// configuration default supplied by the caller, never injected by the
/// pull engine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Create credentials from username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The stock Harbor installation credentials.
    pub fn harbor_default() -> Self {
        Self::new("admin", "Harbor12345")
    }
}

/// Target platform for multi-architecture images.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
        }
    }

    /// The platform of the running host, with Go-style architecture names.
    pub fn native() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self::new(std::env::consts::OS, architecture)
    }

    /// Parse an `os/architecture` pair.
    pub fn parse(s: &str) -> Option<Self> {
        let (os, architecture) = s.split_once('/')?;
        if os.is_empty() || architecture.is_empty() {
            return None;
        }
        Some(Self::new(os, architecture))
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// Pull operation configuration.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Platform to select from a manifest list (None = host platform)
    pub platform: Option<Platform>,

    /// Override for the HTTP Host header, for registries that advertise
    /// an internally unreachable address
    pub hostname: Option<String>,

    /// Skip TLS certificate verification
    pub insecure: bool,

    /// Maximum concurrent layer downloads
    pub max_concurrent_layers: usize,

    /// Retry attempts per blob on transient network failure
    pub blob_retries: u32,

    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Per-request timeout (covers the full blob body)
    pub request_timeout: Duration,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            platform: None,
            hostname: None,
            insecure: false,
            max_concurrent_layers: 4,
            blob_retries: 3,
            connect_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(600),
        }
    }
}

impl PullConfig {
    /// The platform this pull should resolve to.
    pub fn target_platform(&self) -> Platform {
        self.platform.clone().unwrap_or_else(Platform::native)
    }
}
