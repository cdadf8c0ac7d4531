//! In-memory credential holder and the per-session state machine.
//!
//! One [`CredentialStore`] per UI session (tab). The credential is only ever
//! replaced wholesale — never field-mutated — so an observer either sees the
//! old credential or the new one, never a torn one. Consumers subscribe to
//! the state via a watch channel to drive their render mode.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::watch;

use crate::token::{Claims, Subject};

/// The primary credential: bearer value plus decoded claims.
///
/// Immutable once created. In the backend-mediated variant there is no
/// bearer value the client ever sees — the credential is an opaque marker
/// backed by the HTTP-only session cookie, and `token()` is `None`.
#[derive(Clone)]
pub struct Credential {
    token: Option<String>,
    claims: Claims,
    raw: String,
}

impl Credential {
    /// Credential carrying a bearer token (browser-driven variant).
    #[must_use]
    pub fn bearer(token: impl Into<String>, claims: Claims) -> Self {
        let token = token.into();
        Self {
            raw: token.clone(),
            token: Some(token),
            claims,
        }
    }

    /// Cookie-backed credential with no client-visible bearer value
    /// (backend-mediated variant).
    #[must_use]
    pub fn opaque(claims: Claims) -> Self {
        Self {
            token: None,
            claims,
            raw: String::new(),
        }
    }

    /// Bearer value, if this variant exposes one.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    #[must_use]
    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    /// Raw encoding as received from the provider (empty for opaque
    /// credentials).
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.claims.subject
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.claims.expires_at
    }

    /// Whether the credential expires within `lead` from now. Credentials
    /// without an expiry never do.
    #[must_use]
    pub fn expires_within(&self, lead: time::Duration) -> bool {
        match self.claims.expires_at {
            Some(at) => at - OffsetDateTime::now_utc() <= lead,
            None => false,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_within(time::Duration::ZERO)
    }
}

// The bearer value never appears in logs.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("subject", &self.claims.subject)
            .field("expires_at", &self.claims.expires_at)
            .finish()
    }
}

/// Per-tab session state. Exactly one instance per store.
///
/// Transitions are driven only by establishment and refresh outcomes:
///
/// ```text
/// Unauthenticated --establish ok--> Authenticated --refresh fail--> Expired
///        ^                               |                            |
///        '----------- logout -----------'        re-establish --------'
/// ```
#[derive(Debug, Clone, Default)]
pub enum SessionState {
    /// No session. Initial state; also the result of a failed or declined
    /// establishment, and of logout.
    #[default]
    Unauthenticated,
    /// The handshake is in flight.
    Establishing,
    /// A valid credential is held.
    Authenticated(Arc<Credential>),
    /// The credential lapsed and renewal gave up; re-establishment required.
    Expired,
}

impl SessionState {
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    #[must_use]
    pub fn credential(&self) -> Option<&Arc<Credential>> {
        match self {
            Self::Authenticated(c) => Some(c),
            _ => None,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Establishing => "establishing",
            Self::Authenticated(_) => "authenticated",
            Self::Expired => "expired",
        }
    }
}

/// Result of a credential replacement.
#[derive(Debug, Clone)]
pub struct Installed {
    /// The now-current credential.
    pub credential: Arc<Credential>,
    /// A refresh should never yield an earlier expiry than it replaced.
    /// When a provider misbehaves this is flagged (and logged), not failed.
    pub expiry_regressed: bool,
}

/// Holder of the current credential and session state. No persistence.
///
/// Explicitly constructed and passed down — there is deliberately no global
/// singleton here.
pub struct CredentialStore {
    state: watch::Sender<SessionState>,
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Unauthenticated);
        Self { state }
    }

    /// Current state (cloned snapshot).
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Subscribe to state transitions (for render-mode decisions).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn credential(&self) -> Option<Arc<Credential>> {
        self.state.borrow().credential().cloned()
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    /// Move to `Establishing`. Allowed only from `Unauthenticated` or
    /// `Expired`; returns whether the transition happened. This guard is
    /// what makes establishment run exactly once per session lifetime.
    pub(crate) fn begin_establish(&self) -> bool {
        let mut began = false;
        self.state.send_if_modified(|s| match s {
            SessionState::Unauthenticated | SessionState::Expired => {
                *s = SessionState::Establishing;
                began = true;
                true
            }
            _ => false,
        });
        began
    }

    /// Replace the credential wholesale and move to `Authenticated`.
    ///
    /// Any clone of the previous credential captured by an in-flight request
    /// stays valid; only the store's current pointer changes.
    pub fn install(&self, credential: Credential) -> Installed {
        let expiry_regressed = match (
            self.credential().and_then(|c| c.expires_at()),
            credential.expires_at(),
        ) {
            (Some(old), Some(new)) => new < old,
            _ => false,
        };
        if expiry_regressed {
            tracing::warn!(
                subject = %credential.subject(),
                "replacement credential expires earlier than the one it replaces"
            );
        }
        let credential = Arc::new(credential);
        self.state
            .send_replace(SessionState::Authenticated(Arc::clone(&credential)));
        tracing::debug!(subject = %credential.subject(), "credential installed");
        Installed {
            credential,
            expiry_regressed,
        }
    }

    /// Demote `Authenticated` to `Expired` (refresh gave up). No-op from any
    /// other state.
    pub(crate) fn demote_expired(&self) {
        self.state.send_if_modified(|s| {
            if s.is_authenticated() {
                *s = SessionState::Expired;
                tracing::info!("session expired, re-establishment required");
                true
            } else {
                false
            }
        });
    }

    /// Drop everything back to `Unauthenticated` (logout, failed or declined
    /// establishment).
    pub fn clear(&self) {
        self.state.send_replace(SessionState::Unauthenticated);
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}
