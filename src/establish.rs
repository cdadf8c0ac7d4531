//! The establishment capability shared by both deployment variants.

use std::future::Future;

use crate::config::InitMode;
use crate::error::Error;
use crate::store::Credential;

/// Definitive result of one establishment attempt.
///
/// Every branch of the handshake resolves to one of these — there is no
/// implicit page reload or retry loop hidden inside. When the original
/// handshake ends negatively the caller gets [`LoginRequired`] exactly once
/// and decides itself whether to navigate there.
///
/// [`LoginRequired`]: EstablishOutcome::LoginRequired
#[derive(Debug)]
#[non_exhaustive]
pub enum EstablishOutcome {
    /// Handshake succeeded; the credential is ready to install.
    Authenticated(Credential),
    /// No session exists and one can only be created by sending the user to
    /// the provider's login page.
    LoginRequired {
        /// Where to send the user. Issued once per establishment attempt,
        /// never in a loop.
        login_url: String,
    },
    /// Definitive negative result (no existing session to resume, login
    /// declined) with no redirect indicated.
    Unauthenticated,
}

/// One authentication handshake, two polymorphic variants.
///
/// Implemented by [`PkceEstablisher`](crate::oauth::PkceEstablisher)
/// (browser-driven PKCE) and
/// [`BackendEstablisher`](crate::backend::BackendEstablisher)
/// (cookie-session probe). The session manager and refresh scheduler only
/// ever talk to this trait.
pub trait Establish: Send + Sync + 'static {
    /// Receive the configured [`InitMode`] before the first establishment.
    /// Variants whose mount behavior doesn't branch on it ignore the call.
    fn set_init_mode(&mut self, _mode: InitMode) {}

    /// Run the variant's handshake once. Errors are terminal for the attempt
    /// and leave the session `Unauthenticated`.
    fn establish(&self) -> impl Future<Output = Result<EstablishOutcome, Error>> + Send;

    /// Renew the current credential.
    ///
    /// `None` means this variant holds no refresh credential and delegates
    /// renewal entirely (the backend-mediated variant: the server refreshes,
    /// the client re-checks freshness lazily on the next 401). This
    /// asymmetry between variants is deliberate — do not unify it.
    fn renew(&self) -> impl Future<Output = Option<Result<Credential, Error>>> + Send;

    /// Whether `renew` can ever return `Some`. Gates scheduler arming.
    fn supports_renewal(&self) -> bool;

    /// Tear down the variant's session material. Returns a URL the caller
    /// should navigate to, when the provider requires a logout redirect.
    fn logout(&self) -> impl Future<Output = Result<Option<String>, Error>> + Send;
}
