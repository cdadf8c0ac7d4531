//! Error taxonomy for the session lifecycle.
//!
//! Failures inside establishment and refresh are terminal for that operation
//! and end up reflected in [`SessionState`](crate::store::SessionState).
//! Trust-bridge failures use their own type,
//! [`BridgeError`](crate::bridge::BridgeError), because they are local to a
//! single downstream call and never alter the session.

/// Session lifecycle errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Handshake or probe explicitly rejected. The caller should redirect to
    /// login (or surface the rejection) rather than retry.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Transport-level failure. Transient; eligible for bounded retry.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Endpoint answered with an unexpected status.
    #[error("{operation} returned status {status}: {detail}")]
    Status {
        operation: &'static str,
        status: u16,
        detail: String,
    },

    /// Credential renewal gave up. The session is demoted to `Expired` and
    /// must be re-established.
    #[error("credential refresh failed after {attempts} attempt(s): {detail}")]
    Refresh { attempts: u32, detail: String },

    /// Response body could not be parsed. Fatal for the enclosing operation,
    /// never for the process.
    #[error("malformed response from {operation}: {detail}")]
    MalformedResponse {
        operation: &'static str,
        detail: String,
    },

    /// Token decode or verification failure.
    #[error("token error: {0}")]
    Token(String),

    /// Missing or invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// `start()` was called while establishment already ran for this
    /// session lifetime. Re-invoke only after logout.
    #[error("session establishment already ran (state: {state})")]
    AlreadyEstablished { state: &'static str },
}

impl Error {
    /// Whether a bounded retry with backoff is worth attempting.
    ///
    /// Transport errors and 5xx responses are transient; everything else is a
    /// definitive answer from the other side.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Http(_)
                | Self::Status {
                    status: 500..=599,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_transient() {
        let e = Error::Status {
            operation: "token refresh",
            status: 503,
            detail: "unavailable".into(),
        };
        assert!(e.is_transient());
    }

    #[test]
    fn client_errors_are_not_transient() {
        let e = Error::Status {
            operation: "token refresh",
            status: 400,
            detail: "invalid_grant".into(),
        };
        assert!(!e.is_transient());
        assert!(!Error::Authentication("declined".into()).is_transient());
    }
}
