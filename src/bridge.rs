//! Trust bridge: exchanging the primary credential for a token the
//! downstream data service accepts.
//!
//! Bridged credentials are derived on demand and never cached — their
//! claims must reflect the *current* primary credential, and staleness here
//! means wrong-user data access, not just a slow call. Failures stay local
//! to the one downstream call; they never alter the session state.

use serde::Deserialize;
use url::Url;

use crate::store::{Credential, CredentialStore, SessionState};
use crate::token::{self, Claims, Subject};

/// Trust-bridge failure modes.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// The session is not `Authenticated`. Decided before any network call.
    #[error("not authenticated")]
    NotAuthenticated,

    /// Network failure or 5xx from the exchange service. Retried once
    /// internally before being surfaced.
    #[error("exchange service unavailable: {0}")]
    ExchangeUnavailable(String),

    /// The exchange service deemed the primary credential invalid (4xx).
    /// Not retried — re-run session establishment instead.
    #[error("exchange rejected the primary credential (status {0})")]
    ExchangeRejected(u16),

    /// The exchange response did not parse. Fatal for this call, harmless
    /// for the session.
    #[error("malformed exchange response: {0}")]
    MalformedResponse(String),
}

/// Short-lived credential scoped to the downstream data service.
///
/// Use it for exactly one batch of downstream calls, then discard it.
#[derive(Clone)]
pub struct BridgedCredential {
    token: String,
    claims: Claims,
}

impl BridgedCredential {
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn into_token(self) -> String {
        self.token
    }

    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.claims.subject
    }
}

impl std::fmt::Debug for BridgedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedCredential")
            .field("token", &"<redacted>")
            .field("subject", &self.claims.subject)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    access_token: String,
}

/// Client for the exchange endpoint that converts the primary credential
/// into a downstream-scoped token.
pub struct TrustBridge {
    exchange_url: Url,
    http: reqwest::Client,
}

impl TrustBridge {
    #[must_use]
    pub fn new(exchange_url: Url) -> Self {
        Self {
            exchange_url,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client. For the backend-mediated variant pass the
    /// establisher's cookie-carrying client so the exchange request is
    /// session-credentialed.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Derive a downstream credential from the current primary credential.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotAuthenticated`] if the session is in any state but
    /// `Authenticated` (no network call is attempted); otherwise one of the
    /// exchange failure modes.
    pub async fn bridge(&self, store: &CredentialStore) -> Result<BridgedCredential, BridgeError> {
        let credential = match store.state() {
            SessionState::Authenticated(credential) => credential,
            _ => return Err(BridgeError::NotAuthenticated),
        };

        match self.exchange_once(&credential).await {
            Err(BridgeError::ExchangeUnavailable(detail)) => {
                tracing::debug!(detail = %detail, "exchange unavailable, retrying once");
                self.exchange_once(&credential).await
            }
            other => other,
        }
    }

    async fn exchange_once(
        &self,
        credential: &Credential,
    ) -> Result<BridgedCredential, BridgeError> {
        let mut request = self.http.get(self.exchange_url.clone());
        if let Some(bearer) = credential.token() {
            request = request.bearer_auth(bearer);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BridgeError::ExchangeUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BridgeError::ExchangeUnavailable(format!("status {status}")));
        }
        if status.is_client_error() {
            tracing::warn!(status = status.as_u16(), "exchange rejected the credential");
            return Err(BridgeError::ExchangeRejected(status.as_u16()));
        }

        let body: ExchangeResponse = response
            .json()
            .await
            .map_err(|e| BridgeError::MalformedResponse(e.to_string()))?;
        // The exchange service signs for the downstream's trust domain; the
        // downstream validates the signature, we only need the claims.
        let claims = token::unverified_claims(&body.access_token)
            .map_err(|e| BridgeError::MalformedResponse(e.to_string()))?;

        tracing::debug!(subject = %claims.subject, "bridged credential derived");
        Ok(BridgedCredential {
            token: body.access_token,
            claims,
        })
    }
}

/// How downstream calls authenticate.
///
/// The anonymous key is a reduced-trust fallback for deployments without an
/// exchange endpoint; expect read-only access downstream.
pub enum DownstreamAuth {
    Bridge(TrustBridge),
    AnonymousKey(String),
}

impl DownstreamAuth {
    /// Bearer value for one batch of downstream calls. Recomputed per batch
    /// when bridged; never cached.
    ///
    /// # Errors
    ///
    /// Bridged mode propagates [`TrustBridge::bridge`] failures; the
    /// anonymous key never fails.
    pub async fn bearer(&self, store: &CredentialStore) -> Result<String, BridgeError> {
        match self {
            Self::Bridge(bridge) => Ok(bridge.bridge(store).await?.into_token()),
            Self::AnonymousKey(key) => Ok(key.clone()),
        }
    }
}
