//! Browser-driven PKCE variant: the client drives the full
//! authorization-code exchange with the provider itself.

use std::sync::Mutex;

use serde::Deserialize;
use url::Url;

use crate::config::InitMode;
use crate::error::Error;
use crate::establish::{Establish, EstablishOutcome};
use crate::pkce::{self, PkceChallenge};
use crate::store::Credential;
use crate::token::TokenVerifier;

/// Provider (`OAuth2`/OIDC) endpoint configuration.
///
/// Required fields are constructor parameters — no runtime "missing field"
/// errors. Endpoints derive from the issuer the way Keycloak lays them out;
/// override any of them for other providers.
///
/// ```rust,ignore
/// use oidc_session::oauth::OAuthConfig;
///
/// let config = OAuthConfig::new(
///     "my-client-id",
///     "https://idp.example.com/realms/app".parse()?,
///     "https://my-app.com/callback".parse()?,
/// );
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct OAuthConfig {
    pub(crate) client_id: String,
    pub(crate) issuer: Url,
    pub(crate) auth_url: Url,
    pub(crate) token_url: Url,
    pub(crate) logout_url: Url,
    pub(crate) redirect_uri: Url,
    pub(crate) scopes: Vec<String>,
}

fn issuer_endpoint(issuer: &Url, suffix: &str) -> Url {
    format!("{}/{}", issuer.as_str().trim_end_matches('/'), suffix)
        .parse()
        .expect("issuer-derived URL is valid")
}

impl OAuthConfig {
    /// Create a new `OAuth2` configuration with Keycloak-convention
    /// endpoints derived from the issuer.
    #[must_use]
    pub fn new(client_id: impl Into<String>, issuer: Url, redirect_uri: Url) -> Self {
        let auth_url = issuer_endpoint(&issuer, "protocol/openid-connect/auth");
        let token_url = issuer_endpoint(&issuer, "protocol/openid-connect/token");
        let logout_url = issuer_endpoint(&issuer, "protocol/openid-connect/logout");
        Self {
            client_id: client_id.into(),
            issuer,
            auth_url,
            token_url,
            logout_url,
            redirect_uri,
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `OIDC_CLIENT_ID`: `OAuth2` client ID
    /// - `OIDC_ISSUER`: provider issuer URL (realm URL for Keycloak)
    /// - `OIDC_REDIRECT_URI`: `OAuth2` callback URI
    ///
    /// # Optional env vars
    /// - `OIDC_SCOPES`: comma-separated scopes
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required vars are missing or URLs are
    /// invalid.
    pub fn from_env() -> Result<Self, Error> {
        let client_id = std::env::var("OIDC_CLIENT_ID")
            .map_err(|_| Error::Config("OIDC_CLIENT_ID is required".into()))?;
        let issuer: Url = std::env::var("OIDC_ISSUER")
            .map_err(|_| Error::Config("OIDC_ISSUER is required".into()))?
            .parse()
            .map_err(|e| Error::Config(format!("OIDC_ISSUER: {e}")))?;
        let redirect_uri: Url = std::env::var("OIDC_REDIRECT_URI")
            .map_err(|_| Error::Config("OIDC_REDIRECT_URI is required".into()))?
            .parse()
            .map_err(|e| Error::Config(format!("OIDC_REDIRECT_URI: {e}")))?;

        let mut config = Self::new(client_id, issuer, redirect_uri);
        if let Ok(scopes) = std::env::var("OIDC_SCOPES") {
            config.scopes = scopes.split(',').map(|s| s.trim().to_string()).collect();
        }
        Ok(config)
    }

    /// Override the authorization endpoint.
    #[must_use]
    pub fn with_auth_url(mut self, url: Url) -> Self {
        self.auth_url = url;
        self
    }

    /// Override the token endpoint.
    #[must_use]
    pub fn with_token_url(mut self, url: Url) -> Self {
        self.token_url = url;
        self
    }

    /// Override the logout endpoint.
    #[must_use]
    pub fn with_logout_url(mut self, url: Url) -> Self {
        self.logout_url = url;
        self
    }

    /// Override the `OAuth2` scopes (default: `["openid", "profile", "email"]`).
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn issuer(&self) -> &Url {
        &self.issuer
    }

    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }
}

/// Authorization URL with the PKCE parameters the caller must hold on to
/// until the provider redirects back.
#[non_exhaustive]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub code_verifier: String,
}

/// Token response from the provider's token endpoint.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Low-level `OAuth2` client for the provider's endpoints.
pub struct AuthClient {
    config: OAuthConfig,
    http: reqwest::Client,
}

impl AuthClient {
    #[must_use]
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    /// Generate an authorization URL with fresh PKCE parameters.
    #[must_use]
    pub fn authorization_url(&self) -> AuthorizationRequest {
        let state = pkce::generate_state();
        let challenge = PkceChallenge::generate();
        let scope = self.config.scopes.join(" ");

        let mut url = self.config.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", self.config.redirect_uri.as_str())
            .append_pair("state", &state)
            .append_pair("code_challenge", challenge.challenge())
            .append_pair("code_challenge_method", PkceChallenge::METHOD)
            .append_pair("scope", &scope);

        AuthorizationRequest {
            url: url.into(),
            state,
            code_verifier: challenge.verifier().to_string(),
        }
    }

    /// Provider logout URL with a post-logout redirect.
    #[must_use]
    pub fn logout_url(&self, redirect_uri: &str) -> String {
        let mut url = self.config.logout_url.clone();
        url.query_pairs_mut()
            .append_pair("redirect_uri", redirect_uri);
        url.into()
    }

    /// Exchange an authorization code for tokens using PKCE.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] on network failure, [`Error::Status`] if the
    /// token endpoint rejects the exchange, or [`Error::MalformedResponse`]
    /// if the body does not parse.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, Error> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("client_id", self.config.client_id.as_str()),
            ("code_verifier", code_verifier),
        ];
        self.token_request(&params, "code exchange").await
    }

    /// Renew tokens with a refresh token.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`exchange_code`](Self::exchange_code).
    pub async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenResponse, Error> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
        ];
        self.token_request(&params, "token refresh").await
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
        operation: &'static str,
    ) -> Result<TokenResponse, Error> {
        let response = self
            .http
            .post(self.config.token_url.clone())
            .form(params)
            .send()
            .await?;

        let response = Self::ensure_success(response, operation).await?;
        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::MalformedResponse {
                operation,
                detail: e.to_string(),
            })
    }

    /// Checks HTTP response status; returns the response on success or an
    /// error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let detail = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::BAD_REQUEST
        {
            // invalid_grant and friends: the provider said no, definitively.
            return Err(Error::Authentication(format!("{operation}: {detail}")));
        }
        Err(Error::Status {
            operation,
            status: status.as_u16(),
            detail,
        })
    }
}

/// Query parameters the provider appends when redirecting back.
#[derive(Debug, Clone, Default, Deserialize)]
#[non_exhaustive]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Successful callback (code + state present).
    #[must_use]
    pub fn success(code: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            state: Some(state.into()),
            ..Self::default()
        }
    }

    /// Provider-reported error callback.
    #[must_use]
    pub fn failure(error: impl Into<String>, description: Option<String>) -> Self {
        Self {
            error: Some(error.into()),
            error_description: description,
            ..Self::default()
        }
    }
}

struct PendingAuthorization {
    state: String,
    code_verifier: String,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Session establisher for the browser-driven PKCE variant.
///
/// `establish()` resumes an existing session when a saved refresh credential
/// is available; otherwise the configured [`InitMode`] decides between a
/// login redirect and staying unauthenticated. The redirect round-trip
/// completes through [`complete_login`](Self::complete_login).
pub struct PkceEstablisher {
    client: AuthClient,
    verifier: TokenVerifier,
    init_mode: InitMode,
    pending: Mutex<Option<PendingAuthorization>>,
    refresh_token: Mutex<Option<String>>,
}

impl PkceEstablisher {
    #[must_use]
    pub fn new(client: AuthClient, verifier: TokenVerifier) -> Self {
        Self {
            client,
            verifier,
            init_mode: InitMode::default(),
            pending: Mutex::new(None),
            refresh_token: Mutex::new(None),
        }
    }

    /// Seed a previously saved refresh credential so `establish()` can
    /// resume the session without a redirect.
    #[must_use]
    pub fn with_resume_refresh_token(self, refresh_token: impl Into<String>) -> Self {
        *lock(&self.refresh_token) = Some(refresh_token.into());
        self
    }

    #[must_use]
    pub fn client(&self) -> &AuthClient {
        &self.client
    }

    /// Begin an authorization round-trip: generates the redirect URL and
    /// retains the PKCE verifier + state for the callback.
    #[must_use]
    pub fn authorization_request(&self) -> AuthorizationRequest {
        let request = self.client.authorization_url();
        *lock(&self.pending) = Some(PendingAuthorization {
            state: request.state.clone(),
            code_verifier: request.code_verifier.clone(),
        });
        request
    }

    /// Complete the round-trip after the provider redirected back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] on a provider-reported error,
    /// missing code/state, or state mismatch; the exchange itself can fail
    /// with any [`AuthClient::exchange_code`] error.
    pub async fn complete_login(&self, params: CallbackParams) -> Result<Credential, Error> {
        if let Some(error) = &params.error {
            let detail = params
                .error_description
                .as_deref()
                .unwrap_or("unknown error");
            tracing::warn!(error = %error, detail = %detail, "provider reported login error");
            return Err(Error::Authentication(format!("{error}: {detail}")));
        }

        let code = params
            .code
            .ok_or_else(|| Error::Authentication("missing authorization code".into()))?;
        let received_state = params
            .state
            .ok_or_else(|| Error::Authentication("missing state parameter".into()))?;

        let pending = lock(&self.pending)
            .take()
            .ok_or_else(|| Error::Authentication("no pending authorization".into()))?;

        if received_state != pending.state {
            tracing::warn!("authorization state mismatch");
            return Err(Error::Authentication("state mismatch".into()));
        }

        let response = self
            .client
            .exchange_code(&code, &pending.code_verifier)
            .await?;
        self.credential_from(response)
    }

    /// Decode and verify a token response into a credential, retaining any
    /// (rotated) refresh token for later renewal.
    fn credential_from(&self, response: TokenResponse) -> Result<Credential, Error> {
        let mut claims = self.verifier.decode(&response.access_token)?;
        if claims.expires_at.is_none() {
            if let Some(secs) = response.expires_in {
                // Providers are free to send absurd lifetimes; saturate
                // rather than wrap or panic.
                let secs = i64::try_from(secs).unwrap_or(i64::MAX);
                claims.expires_at = Some(
                    time::OffsetDateTime::now_utc()
                        .checked_add(time::Duration::seconds(secs))
                        .unwrap_or(time::PrimitiveDateTime::MAX.assume_utc()),
                );
            }
        }
        if let Some(rotated) = response.refresh_token {
            *lock(&self.refresh_token) = Some(rotated);
        }
        Ok(Credential::bearer(response.access_token, claims))
    }
}

impl Establish for PkceEstablisher {
    /// Applied by the session manager from
    /// [`LifecycleConfig`](crate::config::LifecycleConfig) — the one place
    /// the mount behavior is configured.
    fn set_init_mode(&mut self, mode: InitMode) {
        self.init_mode = mode;
    }

    async fn establish(&self) -> Result<EstablishOutcome, Error> {
        let saved = lock(&self.refresh_token).clone();
        if let Some(refresh_token) = saved {
            match self.client.refresh_grant(&refresh_token).await {
                Ok(response) => {
                    tracing::info!("session resumed from saved refresh credential");
                    return Ok(EstablishOutcome::Authenticated(
                        self.credential_from(response)?,
                    ));
                }
                // Don't mask a transient outage as a logged-out user.
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    tracing::info!(error = %e, "saved refresh credential no longer valid");
                    lock(&self.refresh_token).take();
                }
            }
        }

        match self.init_mode {
            InitMode::CheckExistingSession => Ok(EstablishOutcome::Unauthenticated),
            InitMode::RequireLogin => {
                let request = self.authorization_request();
                Ok(EstablishOutcome::LoginRequired {
                    login_url: request.url,
                })
            }
        }
    }

    async fn renew(&self) -> Option<Result<Credential, Error>> {
        let refresh_token = lock(&self.refresh_token).clone()?;
        Some(
            self.client
                .refresh_grant(&refresh_token)
                .await
                .and_then(|response| self.credential_from(response)),
        )
    }

    fn supports_renewal(&self) -> bool {
        true
    }

    async fn logout(&self) -> Result<Option<String>, Error> {
        lock(&self.refresh_token).take();
        lock(&self.pending).take();
        Ok(Some(
            self.client
                .logout_url(self.client.config().redirect_uri.as_str()),
        ))
    }
}
