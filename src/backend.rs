//! Backend-mediated variant: an HTTP-only session cookie stands in for the
//! credential, and the browser never sees PKCE directly.
//!
//! The client issues a single credentialed probe against the backend's
//! session-introspection endpoint. The backend is the trust boundary —
//! claims come back verbatim and renewal is entirely its job; this side
//! re-checks freshness lazily when a protected call answers 401.

use serde::Deserialize;
use url::Url;

use crate::error::Error;
use crate::establish::{Establish, EstablishOutcome};
use crate::store::Credential;
use crate::token::SessionClaims;

/// Backend endpoint configuration.
///
/// Paths derive from the base URL using the proxy's conventional routes;
/// override any of them individually.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct BackendConfig {
    pub(crate) session_url: Url,
    pub(crate) token_url: Url,
    pub(crate) logout_url: Url,
    pub(crate) login_url: Url,
}

fn base_endpoint(base: &Url, suffix: &str) -> Url {
    format!("{}/{}", base.as_str().trim_end_matches('/'), suffix)
        .parse()
        .expect("base-derived URL is valid")
}

impl BackendConfig {
    /// Derive `/auth/session`, `/auth/token`, `/logout`, and `/login` from a
    /// base URL.
    #[must_use]
    pub fn new(base: Url) -> Self {
        Self {
            session_url: base_endpoint(&base, "auth/session"),
            token_url: base_endpoint(&base, "auth/token"),
            logout_url: base_endpoint(&base, "logout"),
            login_url: base_endpoint(&base, "login"),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `SESSION_BASE_URL`: backend base URL
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the variable is missing or not a URL.
    pub fn from_env() -> Result<Self, Error> {
        let base: Url = std::env::var("SESSION_BASE_URL")
            .map_err(|_| Error::Config("SESSION_BASE_URL is required".into()))?
            .parse()
            .map_err(|e| Error::Config(format!("SESSION_BASE_URL: {e}")))?;
        Ok(Self::new(base))
    }

    #[must_use]
    pub fn with_session_url(mut self, url: Url) -> Self {
        self.session_url = url;
        self
    }

    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = url;
        self
    }

    #[must_use]
    pub fn with_logout_url(mut self, url: Url) -> Self {
        self.logout_url = url;
        self
    }

    #[must_use]
    pub fn with_login_url(mut self, url: Url) -> Self {
        self.login_url = url;
        self
    }

    #[must_use]
    pub fn login_url(&self) -> &Url {
        &self.login_url
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

/// Session establisher for the backend-mediated variant.
pub struct BackendEstablisher {
    config: BackendConfig,
    http: reqwest::Client,
}

impl BackendEstablisher {
    /// Build with a cookie-aware HTTP client (the session cookie is the
    /// credential).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be constructed.
    pub fn new(config: BackendConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder().cookie_store(true).build()?;
        Ok(Self { config, http })
    }

    /// Use a custom HTTP client. It must carry the session cookie for the
    /// backend's origin.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// The cookie-carrying client, for sharing with a
    /// [`TrustBridge`](crate::bridge::TrustBridge) against the same backend.
    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Fetch the provider access token held by the backend session.
    ///
    /// Used on demand for one batch of downstream calls; never persisted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] on 401 (the session lapsed — the
    /// caller should re-run establishment), [`Error::Status`] on other
    /// statuses, [`Error::MalformedResponse`] on an unparseable body.
    pub async fn access_token(&self) -> Result<String, Error> {
        let response = self.http.get(self.config.token_url.clone()).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication(
                "backend session no longer valid".into(),
            ));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                operation: "token retrieval",
                status: status.as_u16(),
                detail,
            });
        }
        let body: AccessTokenResponse =
            response
                .json()
                .await
                .map_err(|e| Error::MalformedResponse {
                    operation: "token retrieval",
                    detail: e.to_string(),
                })?;
        Ok(body.access_token)
    }
}

impl Establish for BackendEstablisher {
    /// Probe the session endpoint.
    ///
    /// 200 → authenticated, claims taken verbatim. 401 → the one case that
    /// yields a login redirect. Anything else (network error, odd status,
    /// malformed body) is surfaced as an error and does NOT redirect, so a
    /// transient outage is never mistaken for a logout.
    async fn establish(&self) -> Result<EstablishOutcome, Error> {
        let response = self
            .http
            .get(self.config.session_url.clone())
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            tracing::info!("no backend session, login required");
            return Ok(EstablishOutcome::LoginRequired {
                login_url: self.config.login_url.to_string(),
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            tracing::error!(status = status.as_u16(), "session probe failed");
            return Err(Error::Status {
                operation: "session probe",
                status: status.as_u16(),
                detail,
            });
        }

        let body: SessionClaims =
            response
                .json()
                .await
                .map_err(|e| Error::MalformedResponse {
                    operation: "session probe",
                    detail: e.to_string(),
                })?;
        let claims = body.into_claims()?;
        tracing::info!(subject = %claims.subject, "backend session established");
        Ok(EstablishOutcome::Authenticated(Credential::opaque(claims)))
    }

    /// The browser holds no refresh credential here; the server renews and
    /// freshness is re-checked lazily on the next 401.
    async fn renew(&self) -> Option<Result<Credential, Error>> {
        None
    }

    fn supports_renewal(&self) -> bool {
        false
    }

    /// `POST` the logout endpoint to invalidate the session cookie.
    async fn logout(&self) -> Result<Option<String>, Error> {
        let response = self.http.post(self.config.logout_url.clone()).send().await?;
        if !response.status().is_success() {
            tracing::warn!(
                status = response.status().as_u16(),
                "backend logout returned non-success"
            );
        }
        Ok(None)
    }
}
