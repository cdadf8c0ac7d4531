use std::collections::BTreeSet;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use derive_more::{Display, From, Into};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::Error;

/// Provider user identifier (the `sub` claim). Opaque to this crate.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct Subject(pub String);

impl Subject {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity facts decoded from (or returned alongside) a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Claims {
    pub subject: Subject,
    pub roles: BTreeSet<String>,
    pub issued_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,
}

impl Claims {
    /// Create claims with only the required subject.
    #[must_use]
    pub fn new(subject: impl Into<Subject>) -> Self {
        Self {
            subject: subject.into(),
            roles: BTreeSet::new(),
            issued_at: None,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_expires_at(mut self, at: OffsetDateTime) -> Self {
        self.expires_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_issued_at(mut self, at: OffsetDateTime) -> Self {
        self.issued_at = Some(at);
        self
    }

    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Keycloak-style role container (`realm_access: { roles: [...] }`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleSet {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Raw JWT payload as issued by the provider.
#[derive(Debug, Deserialize)]
struct RawTokenClaims {
    sub: String,
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    iat: Option<i64>,
    #[serde(default)]
    iss: Option<String>,
    #[serde(default)]
    realm_access: Option<RoleSet>,
}

impl RawTokenClaims {
    fn into_claims(self) -> Result<Claims, Error> {
        let expires_at = self.exp.map(timestamp).transpose()?;
        let issued_at = self.iat.map(timestamp).transpose()?;
        Ok(Claims {
            subject: Subject(self.sub),
            roles: self
                .realm_access
                .map(|r| r.roles.into_iter().collect())
                .unwrap_or_default(),
            issued_at,
            expires_at,
        })
    }
}

fn timestamp(secs: i64) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| Error::Token(format!("timestamp out of range: {e}")))
}

/// Session-introspection body returned by a backend session endpoint.
///
/// Taken verbatim — the backend is the trust boundary, the client does no
/// independent verification of these fields.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct SessionClaims {
    pub subject: Subject,
    #[serde(default)]
    pub roles: Option<RoleSet>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Unix timestamp, when the backend chooses to expose the session expiry.
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl SessionClaims {
    pub(crate) fn into_claims(self) -> Result<Claims, Error> {
        let expires_at = self.expires_at.map(timestamp).transpose()?;
        Ok(Claims {
            subject: self.subject,
            roles: self
                .roles
                .map(|r| r.roles.into_iter().collect())
                .unwrap_or_default(),
            issued_at: None,
            expires_at,
        })
    }
}

/// Decodes a JWT payload without verifying the signature.
///
/// For tokens crossing an already-trusted boundary (the trust-bridge
/// exchange, the backend token endpoint) where the receiving service, not
/// this client, validates the signature.
///
/// # Errors
///
/// Returns [`Error::Token`] if the compact encoding is malformed, or the
/// payload is not valid claim JSON.
pub fn unverified_claims(raw: &str) -> Result<Claims, Error> {
    let payload = payload_segment(raw)?;
    let parsed: RawTokenClaims = serde_json::from_slice(&payload)
        .map_err(|e| Error::Token(format!("invalid claim payload: {e}")))?;
    parsed.into_claims()
}

/// Extracts and decodes the payload segment of a compact JWT.
fn payload_segment(raw: &str) -> Result<Vec<u8>, Error> {
    let mut parts = raw.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| Error::Token("invalid payload encoding".into())),
        _ => Err(Error::Token("not a three-segment JWT".into())),
    }
}

/// Credential decoder for the browser-driven variant.
///
/// With a decoding key configured, the signature, issuer, and audience are
/// all verified before any claim is trusted. Without one, the payload is
/// decoded as-is with an issuer check only — intended for deployments where
/// a backend already validated the token.
#[derive(Clone)]
pub struct TokenVerifier {
    key: Option<(DecodingKey, Algorithm)>,
    issuer: Option<String>,
    audience: Option<String>,
}

impl TokenVerifier {
    /// Verifier that checks signature, expiry, and any configured
    /// issuer/audience.
    #[must_use]
    pub fn new(key: DecodingKey, algorithm: Algorithm) -> Self {
        Self {
            key: Some((key, algorithm)),
            issuer: None,
            audience: None,
        }
    }

    /// Decode-only mode. Claims are taken on faith; only a configured issuer
    /// is cross-checked.
    #[must_use]
    pub fn unverified() -> Self {
        Self {
            key: None,
            issuer: None,
            audience: None,
        }
    }

    /// Require the `iss` claim to match.
    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Require the `aud` claim to match (verified mode only).
    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Decode a credential into [`Claims`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Token`] on signature, expiry, issuer, or audience
    /// mismatch, or if the token cannot be parsed.
    pub fn decode(&self, raw: &str) -> Result<Claims, Error> {
        match &self.key {
            Some((key, algorithm)) => {
                let mut validation = Validation::new(*algorithm);
                if let Some(issuer) = &self.issuer {
                    validation.set_issuer(&[issuer]);
                }
                match &self.audience {
                    Some(audience) => validation.set_audience(&[audience]),
                    None => validation.validate_aud = false,
                }
                let data = jsonwebtoken::decode::<RawTokenClaims>(raw, key, &validation)
                    .map_err(|e| Error::Token(e.to_string()))?;
                data.claims.into_claims()
            }
            None => {
                let payload = payload_segment(raw)?;
                let parsed: RawTokenClaims = serde_json::from_slice(&payload)
                    .map_err(|e| Error::Token(format!("invalid claim payload: {e}")))?;
                if let (Some(expected), Some(actual)) = (&self.issuer, &parsed.iss) {
                    if expected != actual {
                        return Err(Error::Token(format!(
                            "iss: expected '{expected}', got '{actual}'"
                        )));
                    }
                }
                parsed.into_claims()
            }
        }
    }
}
