//! Session consumer surface: one manager per UI session (tab).
//!
//! Owns the credential store, the establisher, and the refresh scheduler,
//! and enforces the ordering guarantee: establishment completes (success or
//! definitive failure) before the scheduler arms or any bridge call runs.
//! Teardown is cooperative — every completion handler is fenced by an epoch
//! so a late-arriving result never mutates a torn-down session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::bridge::{BridgeError, BridgedCredential, DownstreamAuth, TrustBridge};
use crate::config::LifecycleConfig;
use crate::error::Error;
use crate::establish::{Establish, EstablishOutcome};
use crate::refresh::{RefreshPhase, RefreshScheduler};
use crate::store::{Credential, CredentialStore, SessionState};

/// What the consumer should do after `start()`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StartOutcome {
    /// Render the authenticated view; the scheduler is armed.
    Authenticated,
    /// Navigate to `login_url` — issued exactly once per `start()`, never
    /// in a loop.
    LoginRequired { login_url: String },
    /// Render the unauthenticated view; the caller may retry explicitly.
    Unauthenticated,
}

/// Lifecycle manager for one session.
pub struct SessionManager<E: Establish> {
    store: Arc<CredentialStore>,
    establisher: Arc<E>,
    scheduler: Arc<RefreshScheduler<E>>,
    downstream: Option<DownstreamAuth>,
    /// Bumped on logout/teardown; in-flight completions compare against it
    /// before touching the store.
    epoch: Arc<AtomicU64>,
}

impl<E: Establish> SessionManager<E> {
    #[must_use]
    pub fn new(mut establisher: E, config: LifecycleConfig) -> Self {
        establisher.set_init_mode(config.init_mode());
        let store = Arc::new(CredentialStore::new());
        let establisher = Arc::new(establisher);
        let epoch = Arc::new(AtomicU64::new(0));
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&store),
            Arc::clone(&establisher),
            &config,
            Arc::clone(&epoch),
        ));
        Self {
            store,
            establisher,
            scheduler,
            downstream: None,
            epoch,
        }
    }

    /// Configure how downstream calls authenticate.
    #[must_use]
    pub fn with_downstream(mut self, downstream: DownstreamAuth) -> Self {
        self.downstream = Some(downstream);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    #[must_use]
    pub fn establisher(&self) -> &Arc<E> {
        &self.establisher
    }

    /// Current session state (cloned snapshot).
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.store.state()
    }

    /// Subscribe to session state transitions (render-mode driver).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.store.subscribe()
    }

    #[must_use]
    pub fn refresh_phase(&self) -> RefreshPhase {
        self.scheduler.phase()
    }

    #[must_use]
    pub fn subscribe_refresh(&self) -> watch::Receiver<RefreshPhase> {
        self.scheduler.subscribe()
    }

    /// Run establishment once for this session lifetime.
    ///
    /// Guarded by the state machine: only `Unauthenticated` or `Expired`
    /// sessions may establish. On success the store is populated and the
    /// scheduler arms itself; every failure path resolves to a defined
    /// state, never an implicit reload.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyEstablished`] when invoked out of order; otherwise
    /// whatever the variant's handshake surfaced. After an error the
    /// session is `Unauthenticated` and an explicit retry is allowed.
    pub async fn start(&self) -> Result<StartOutcome, Error> {
        if !self.store.begin_establish() {
            return Err(Error::AlreadyEstablished {
                state: self.store.state().name(),
            });
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let result = self.establisher.establish().await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("session torn down during establishment, result dropped");
            return Err(Error::Authentication(
                "session torn down during establishment".into(),
            ));
        }

        match result {
            Ok(EstablishOutcome::Authenticated(credential)) => {
                self.store.install(credential);
                self.scheduler.arm();
                Ok(StartOutcome::Authenticated)
            }
            Ok(EstablishOutcome::LoginRequired { login_url }) => {
                self.store.clear();
                Ok(StartOutcome::LoginRequired { login_url })
            }
            Ok(EstablishOutcome::Unauthenticated) => {
                self.store.clear();
                Ok(StartOutcome::Unauthenticated)
            }
            Err(e) => {
                tracing::error!(error = %e, "session establishment failed");
                self.store.clear();
                Err(e)
            }
        }
    }

    /// Renew the credential immediately (or join an in-flight renewal).
    ///
    /// # Errors
    ///
    /// See [`RefreshScheduler::refresh_now`].
    pub async fn refresh_now(&self) -> Result<Arc<Credential>, Error> {
        self.scheduler.refresh_now().await
    }

    /// The configured trust bridge, if downstream auth uses one.
    #[must_use]
    pub fn trust_bridge(&self) -> Option<&TrustBridge> {
        match &self.downstream {
            Some(DownstreamAuth::Bridge(bridge)) => Some(bridge),
            _ => None,
        }
    }

    /// Derive a downstream credential from the current session.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotAuthenticated`] when no bridge is configured or
    /// the session is not authenticated; otherwise the exchange's failure
    /// modes. Failures here never alter the session state.
    pub async fn bridge(&self) -> Result<BridgedCredential, BridgeError> {
        let bridge = self
            .trust_bridge()
            .ok_or(BridgeError::NotAuthenticated)?;
        bridge.bridge(&self.store).await
    }

    /// Bearer value for one batch of downstream calls (bridged or
    /// anonymous-key fallback).
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotAuthenticated`] when no downstream auth is
    /// configured; otherwise see [`DownstreamAuth::bearer`].
    pub async fn downstream_bearer(&self) -> Result<String, BridgeError> {
        let downstream = self
            .downstream
            .as_ref()
            .ok_or(BridgeError::NotAuthenticated)?;
        downstream.bearer(&self.store).await
    }

    /// End the session: disarm the scheduler, clear the store, and run the
    /// variant's logout. Returns a URL to navigate to when the provider
    /// requires a logout redirect.
    ///
    /// # Errors
    ///
    /// Propagates the variant's logout failure; the local session is torn
    /// down regardless.
    pub async fn logout(&self) -> Result<Option<String>, Error> {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.scheduler.disarm();
        self.store.clear();
        tracing::info!("session logged out");
        self.establisher.logout().await
    }

    /// Tear down without logging out (page unload / unmount): cancel every
    /// pending timer and fence late completions. No state mutation happens
    /// after this returns.
    pub fn shutdown(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.scheduler.disarm();
        tracing::debug!("session manager shut down");
    }
}

#[cfg(feature = "browser")]
impl SessionManager<crate::oauth::PkceEstablisher> {
    /// Begin an explicit login redirect (for consumers that want a login
    /// button rather than `RequireLogin` on mount).
    #[must_use]
    pub fn authorization_request(&self) -> crate::oauth::AuthorizationRequest {
        self.establisher.authorization_request()
    }

    /// Complete the PKCE round-trip after the provider redirected back,
    /// install the credential, and arm the scheduler.
    ///
    /// # Errors
    ///
    /// See [`PkceEstablisher::complete_login`](crate::oauth::PkceEstablisher::complete_login).
    pub async fn complete_login(
        &self,
        params: crate::oauth::CallbackParams,
    ) -> Result<(), Error> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let credential = self.establisher.complete_login(params).await?;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            tracing::debug!("session torn down during login completion, result dropped");
            return Err(Error::Authentication(
                "session torn down during login completion".into(),
            ));
        }
        self.store.install(credential);
        self.scheduler.arm();
        Ok(())
    }
}

#[cfg(feature = "backend")]
impl SessionManager<crate::backend::BackendEstablisher> {
    /// Fetch the provider access token from the backend session, for one
    /// batch of calls. A 401 demotes the session so the consumer re-runs
    /// establishment — the lazy freshness recheck of this variant.
    ///
    /// # Errors
    ///
    /// See [`BackendEstablisher::access_token`](crate::backend::BackendEstablisher::access_token).
    pub async fn access_token(&self) -> Result<String, Error> {
        match self.establisher.access_token().await {
            Ok(token) => Ok(token),
            Err(e @ Error::Authentication(_)) => {
                self.store.clear();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}
