#![doc = include_str!("../README.md")]

#[cfg(feature = "backend")]
pub mod backend;
pub mod bridge;
pub mod config;
pub mod error;
pub mod establish;
#[cfg(feature = "browser")]
pub mod oauth;
#[cfg(feature = "browser")]
pub mod pkce;
pub mod refresh;
pub mod session;
pub mod store;
pub mod token;

// Re-exports for convenient access
#[cfg(feature = "backend")]
pub use backend::{BackendConfig, BackendEstablisher};
pub use bridge::{BridgeError, BridgedCredential, DownstreamAuth, TrustBridge};
pub use config::{InitMode, LifecycleConfig, RetryPolicy};
pub use error::Error;
pub use establish::{Establish, EstablishOutcome};
#[cfg(feature = "browser")]
pub use oauth::{
    AuthClient, AuthorizationRequest, CallbackParams, OAuthConfig, PkceEstablisher, TokenResponse,
};
#[cfg(feature = "browser")]
pub use pkce::PkceChallenge;
pub use refresh::{RefreshPhase, RefreshScheduler};
pub use session::{SessionManager, StartOutcome};
pub use store::{Credential, CredentialStore, Installed, SessionState};
pub use token::{Claims, SessionClaims, Subject, TokenVerifier};
