use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use sha2::{Digest, Sha256};

/// PKCE verifier/challenge pair for one authorization round-trip (RFC 7636).
///
/// The verifier stays with the client; only the S256 challenge travels to the
/// provider's authorization endpoint. Generate a fresh pair per login attempt.
#[derive(Clone)]
pub struct PkceChallenge {
    verifier: String,
    challenge: String,
}

impl PkceChallenge {
    /// Challenge derivation method sent as `code_challenge_method`.
    pub const METHOD: &'static str = "S256";

    /// Generates a cryptographically random verifier and its S256 challenge.
    ///
    /// The verifier is a 43-character URL-safe string (32 random bytes →
    /// base64url, within the RFC's 43-128 range);
    /// `challenge = BASE64URL(SHA256(verifier))`.
    #[must_use]
    pub fn generate() -> Self {
        let random_bytes: [u8; 32] = rand::rng().random();
        let verifier = URL_SAFE_NO_PAD.encode(random_bytes);
        let challenge = derive_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// The secret half, used later in the code exchange.
    #[must_use]
    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// The public half, sent with the authorization request.
    #[must_use]
    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

// Never log the verifier.
impl std::fmt::Debug for PkceChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkceChallenge")
            .field("verifier", &"<redacted>")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Computes the S256 challenge for an existing verifier.
#[must_use]
pub fn derive_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generates a cryptographically random `state` parameter for `OAuth2`.
///
/// Returns a 32-character URL-safe string (24 random bytes → base64url).
#[must_use]
pub fn generate_state() -> String {
    let random_bytes: [u8; 24] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(random_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_length_in_rfc_range() {
        let pkce = PkceChallenge::generate();
        assert!((43..=128).contains(&pkce.verifier().len()));
    }

    #[test]
    fn test_verifier_url_safe() {
        let pkce = PkceChallenge::generate();
        assert!(
            pkce.verifier()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "verifier should be URL-safe: {}",
            pkce.verifier()
        );
    }

    #[test]
    fn test_pairs_are_unique() {
        let a = PkceChallenge::generate();
        let b = PkceChallenge::generate();
        assert_ne!(a.verifier(), b.verifier());
        assert_ne!(a.challenge(), b.challenge());
    }

    #[test]
    fn test_challenge_deterministic_for_verifier() {
        let pkce = PkceChallenge::generate();
        assert_eq!(pkce.challenge(), derive_challenge(pkce.verifier()));
        assert_eq!(
            derive_challenge("test_verifier_string"),
            derive_challenge("test_verifier_string")
        );
    }

    #[test]
    fn test_state_length_and_uniqueness() {
        let s1 = generate_state();
        let s2 = generate_state();
        assert_eq!(s1.len(), 32);
        assert_ne!(s1, s2, "states should be unique");
    }

    #[test]
    fn test_debug_redacts_verifier() {
        let pkce = PkceChallenge::generate();
        let printed = format!("{pkce:?}");
        assert!(!printed.contains(pkce.verifier()));
        assert!(printed.contains("<redacted>"));
    }
}
