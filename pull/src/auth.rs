//! Registry authentication negotiation.
//!
//! Implements the Registry V2 token flow:
//!
//! 1. Anonymous `GET /v2/` probe
//! 2. A 401 with a `WWW-Authenticate: Bearer` header yields a challenge
//! 3. Token request against the challenge's realm, with basic credentials
//! 4. `Authorization: Bearer <token>` on all subsequent requests
//!
//! Registries that never issue a challenge get HTTP Basic auth with the
//! supplied credentials instead. A 401 encountered mid-pull triggers
//! exactly one re-authentication before the operation fails.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use reqwest::header::HOST;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use wharf_core::config::Credentials;
use wharf_core::error::{PullError, Result};

use crate::reference::ImageReference;

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Token service URL
    pub realm: String,
    /// Registry service name, passed through to the token request
    pub service: Option<String>,
    /// Scope advertised by the registry, if any
    pub scope: Option<String>,
}

impl AuthChallenge {
    /// Parse a `WWW-Authenticate` header value.
    ///
    /// Returns `None` for non-Bearer schemes or a challenge without a
    /// realm — both mean the token flow does not apply.
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        // Format: Bearer realm="...",service="...",scope="..."
        for part in rest.split(',') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                let value = value.trim_matches('"').to_string();
                match key {
                    "realm" => realm = Some(value),
                    "service" => service = Some(value),
                    "scope" => scope = Some(value),
                    _ => {}
                }
            }
        }

        realm.map(|realm| Self {
            realm,
            service,
            scope,
        })
    }
}

/// Token service response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    #[allow(dead_code)]
    expires_in: Option<u64>,
}

/// How requests are authorized after the probe.
#[derive(Debug, Clone)]
enum AuthMode {
    /// Token flow against the challenge's realm
    Bearer(AuthChallenge),
    /// HTTP Basic on every request (no challenge was issued)
    Basic,
    /// No credentials supplied, no challenge issued
    Anonymous,
}

/// Authentication state for a single pull operation.
///
/// Holds the negotiated mode and the current token. Tokens are never
/// persisted beyond the session.
pub struct AuthSession {
    client: Client,
    registry: String,
    scope: String,
    credentials: Option<Credentials>,
    hostname: Option<String>,
    mode: AuthMode,
    token: RwLock<Option<String>>,
    reauthorized: AtomicBool,
}

impl AuthSession {
    /// Probe the registry and negotiate the auth mode for `reference`.
    pub async fn establish(
        client: &Client,
        reference: &ImageReference,
        credentials: Option<Credentials>,
        hostname: Option<String>,
    ) -> Result<Self> {
        let registry = reference.registry();
        let scope = format!("repository:{}:pull", reference.repository);

        let mut probe = client.get(format!("{}/v2/", reference.registry_base()));
        if let Some(ref host) = hostname {
            probe = probe.header(HOST, host.clone());
        }

        let response = probe
            .send()
            .await
            .map_err(|e| PullError::Network(format!("auth probe for {}: {}", registry, e)))?;

        let mode = if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|h| h.to_str().ok())
                .and_then(AuthChallenge::parse);

            match challenge {
                Some(challenge) => AuthMode::Bearer(challenge),
                // 401 without a Bearer challenge: the registry wants
                // credentials on the request itself.
                None => AuthMode::Basic,
            }
        } else if credentials.is_some() {
            AuthMode::Basic
        } else {
            AuthMode::Anonymous
        };

        tracing::debug!(registry = %registry, mode = ?mode_name(&mode), "Negotiated registry auth");

        let session = Self {
            client: client.clone(),
            registry,
            scope,
            credentials,
            hostname,
            mode,
            token: RwLock::new(None),
            reauthorized: AtomicBool::new(false),
        };

        if matches!(session.mode, AuthMode::Bearer(_)) {
            session.fetch_token().await?;
        }

        Ok(session)
    }

    /// The HTTP client this session was established with.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Registry `host[:port]` this session authenticates against.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Attach authorization (and the Host override) to a request.
    pub fn apply(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(ref host) = self.hostname {
            request = request.header(HOST, host.clone());
        }

        match &self.mode {
            AuthMode::Bearer(_) => {
                let token = self.token.read().clone();
                if let Some(token) = token {
                    request = request.bearer_auth(token);
                }
                request
            }
            AuthMode::Basic => match &self.credentials {
                Some(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
                None => request,
            },
            AuthMode::Anonymous => request,
        }
    }

    /// Send a request, retrying once through re-authentication on 401.
    ///
    /// `build` must produce a fresh request each time; responses other
    /// than 401 are returned to the caller for status handling.
    pub async fn send_authorized<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let response = self
            .apply(build())
            .send()
            .await
            .map_err(|e| PullError::Network(format!("request to {}: {}", self.registry, e)))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        self.reauthorize().await?;

        let response = self
            .apply(build())
            .send()
            .await
            .map_err(|e| PullError::Network(format!("request to {}: {}", self.registry, e)))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(PullError::AuthExpired {
                registry: self.registry.clone(),
            });
        }

        Ok(response)
    }

    /// Re-authenticate after a mid-pull 401. Allowed exactly once.
    async fn reauthorize(&self) -> Result<()> {
        if self.reauthorized.swap(true, Ordering::SeqCst) {
            return Err(PullError::AuthExpired {
                registry: self.registry.clone(),
            });
        }

        tracing::debug!(registry = %self.registry, "Re-authenticating after 401");

        match self.mode {
            AuthMode::Bearer(_) => self.fetch_token().await,
            // Basic credentials were already rejected; retrying the same
            // pair once more is the single allowed attempt.
            AuthMode::Basic | AuthMode::Anonymous => Ok(()),
        }
    }

    /// Request a token from the challenge's realm and cache it.
    async fn fetch_token(&self) -> Result<()> {
        let challenge = match &self.mode {
            AuthMode::Bearer(challenge) => challenge,
            _ => return Ok(()),
        };

        let scope = challenge.scope.as_deref().unwrap_or(&self.scope);
        let mut request = self.client.get(&challenge.realm).query(&[("scope", scope)]);

        if let Some(ref service) = challenge.service {
            request = request.query(&[("service", service)]);
        }
        if let Some(ref creds) = self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await.map_err(|e| {
            PullError::Network(format!("token service for {}: {}", self.registry, e))
        })?;

        if !response.status().is_success() {
            return Err(PullError::AuthFailed {
                registry: self.registry.clone(),
                message: format!("token service returned {}", response.status().as_u16()),
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| PullError::AuthFailed {
            registry: self.registry.clone(),
            message: format!("invalid token response: {}", e),
        })?;

        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| PullError::AuthFailed {
                registry: self.registry.clone(),
                message: "no token field in response".to_string(),
            })?;

        *self.token.write() = Some(token);
        Ok(())
    }
}

fn mode_name(mode: &AuthMode) -> &'static str {
    match mode {
        AuthMode::Bearer(_) => "bearer",
        AuthMode::Basic => "basic",
        AuthMode::Anonymous => "anonymous",
    }
}
