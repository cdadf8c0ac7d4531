//! Proactive credential renewal.
//!
//! Armed when the session becomes authenticated (and the variant can renew
//! locally); disarmed on logout or teardown. A timer fires a configured
//! lead before expiry and renews with bounded, backed-off retries. Renewal
//! is coalesced: at most one exchange is in flight per session, and
//! triggers arriving meanwhile observe its shared result instead of
//! starting another round-trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{LifecycleConfig, RetryPolicy};
use crate::error::Error;
use crate::establish::Establish;
use crate::store::{Credential, CredentialStore};

/// Scheduler state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPhase {
    /// Not scheduled (no session, or the variant renews server-side).
    #[default]
    Idle,
    /// Timer set against the current credential's expiry.
    Armed,
    /// A renewal exchange is in flight.
    Refreshing,
    /// Renewal gave up; the session was demoted to `Expired`.
    Failed,
}

/// Timer/event-driven renewal loop over one [`CredentialStore`].
pub struct RefreshScheduler<E> {
    store: Arc<CredentialStore>,
    establisher: Arc<E>,
    lead: time::Duration,
    retry: RetryPolicy,
    phase: watch::Sender<RefreshPhase>,
    /// Holder of this lock is the one in-flight renewal.
    gate: tokio::sync::Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
    epoch: Arc<AtomicU64>,
}

impl<E: Establish> RefreshScheduler<E> {
    pub(crate) fn new(
        store: Arc<CredentialStore>,
        establisher: Arc<E>,
        config: &LifecycleConfig,
        epoch: Arc<AtomicU64>,
    ) -> Self {
        let lead = time::Duration::try_from(config.refresh_lead())
            .unwrap_or(time::Duration::seconds(5));
        let (phase, _) = watch::channel(RefreshPhase::Idle);
        Self {
            store,
            establisher,
            lead,
            retry: config.retry(),
            phase,
            gate: tokio::sync::Mutex::new(()),
            timer: Mutex::new(None),
            epoch,
        }
    }

    #[must_use]
    pub fn phase(&self) -> RefreshPhase {
        *self.phase.borrow()
    }

    /// Subscribe to phase transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RefreshPhase> {
        self.phase.subscribe()
    }

    /// Arm against the current credential. A no-op for variants that renew
    /// server-side, and for credentials without an expiry.
    pub(crate) fn arm(self: &Arc<Self>) {
        if !self.establisher.supports_renewal() {
            tracing::debug!("variant renews server-side, scheduler stays idle");
            return;
        }
        let Some(expires_at) = self.store.credential().and_then(|c| c.expires_at()) else {
            tracing::debug!("credential has no expiry, scheduler stays idle");
            return;
        };

        self.phase.send_replace(RefreshPhase::Armed);
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.timer_loop(expires_at).await });
        if let Some(previous) = self.swap_timer(Some(handle)) {
            previous.abort();
        }
        tracing::debug!(%expires_at, "refresh scheduler armed");
    }

    /// Cancel the pending timer. Late completions are additionally fenced by
    /// the epoch check in [`refresh_now`](Self::refresh_now).
    pub(crate) fn disarm(&self) {
        if let Some(handle) = self.swap_timer(None) {
            handle.abort();
        }
        self.phase.send_replace(RefreshPhase::Idle);
    }

    async fn timer_loop(self: Arc<Self>, mut deadline: OffsetDateTime) {
        loop {
            let wait = deadline - self.lead - OffsetDateTime::now_utc();
            if let Ok(wait) = std::time::Duration::try_from(wait) {
                tokio::time::sleep(wait).await;
            }

            match self.refresh_now().await {
                Ok(credential) => match credential.expires_at() {
                    // Guard against a hot loop on a non-advancing expiry.
                    Some(next) if next > deadline => deadline = next,
                    _ => {
                        tracing::warn!("renewed credential did not extend expiry, timer stops");
                        break;
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "scheduled renewal failed");
                    break;
                }
            }
        }
    }

    /// Renew the credential now (or join a renewal already in flight).
    ///
    /// For all trigger sequences while `Refreshing`, at most one network
    /// exchange occurs; coalesced callers get the eventual shared outcome.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Refresh`] when renewal gives up (the session is
    /// demoted to `Expired`), or when joining an in-flight renewal that
    /// failed.
    pub async fn refresh_now(&self) -> Result<Arc<Credential>, Error> {
        if !self.establisher.supports_renewal() {
            // Renewal is the server's job in this variant; the current
            // credential stands until a protected call answers 401. A manual
            // trigger must not invalidate a healthy session.
            return match self.store.credential() {
                Some(credential) => Ok(credential),
                None => Err(Error::Refresh {
                    attempts: 0,
                    detail: "no credential to renew".into(),
                }),
            };
        }
        match self.gate.try_lock() {
            Ok(_in_flight) => {
                let epoch = self.epoch.load(Ordering::SeqCst);
                self.phase.send_replace(RefreshPhase::Refreshing);
                match self.renew_with_retry().await {
                    Ok(credential) => {
                        if self.epoch.load(Ordering::SeqCst) != epoch {
                            tracing::debug!("session torn down mid-renewal, result dropped");
                            return Err(Error::Refresh {
                                attempts: 0,
                                detail: "session torn down during renewal".into(),
                            });
                        }
                        let installed = self.store.install(credential);
                        self.phase.send_replace(RefreshPhase::Armed);
                        Ok(installed.credential)
                    }
                    Err(e) => {
                        if self.epoch.load(Ordering::SeqCst) == epoch {
                            self.phase.send_replace(RefreshPhase::Failed);
                            self.store.demote_expired();
                        }
                        Err(e)
                    }
                }
            }
            Err(_) => {
                // Renewal already in flight: wait for it, then observe its
                // outcome instead of issuing a second exchange.
                let _done = self.gate.lock().await;
                match (self.phase(), self.store.credential()) {
                    (RefreshPhase::Armed, Some(credential)) => Ok(credential),
                    _ => Err(Error::Refresh {
                        attempts: 0,
                        detail: "concurrent renewal failed".into(),
                    }),
                }
            }
        }
    }

    async fn renew_with_retry(&self) -> Result<Credential, Error> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.establisher.renew().await {
                None => {
                    return Err(Error::Refresh {
                        attempts: 0,
                        detail: "variant holds no refresh credential".into(),
                    });
                }
                Some(Ok(credential)) => {
                    tracing::info!(attempt, "credential renewed");
                    return Ok(credential);
                }
                Some(Err(e)) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "renewal attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Some(Err(e)) => {
                    return Err(Error::Refresh {
                        attempts: attempt,
                        detail: e.to_string(),
                    });
                }
            }
        }
    }
}

impl<E> RefreshScheduler<E> {
    fn swap_timer(&self, next: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
        std::mem::replace(
            &mut *self.timer.lock().unwrap_or_else(PoisonError::into_inner),
            next,
        )
    }
}

impl<E> Drop for RefreshScheduler<E> {
    fn drop(&mut self) {
        if let Some(handle) = self.swap_timer(None) {
            handle.abort();
        }
    }
}
