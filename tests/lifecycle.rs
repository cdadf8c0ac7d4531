//! End-to-end lifecycle scenarios against a mocked provider/backend.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{EncodingKey, Header};
use serde_json::json;
use time::OffsetDateTime;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oidc_session::{
    AuthClient, BackendConfig, BackendEstablisher, BridgeError, CredentialStore, DownstreamAuth,
    Error, InitMode, LifecycleConfig, OAuthConfig, PkceEstablisher, RefreshPhase, RetryPolicy,
    SessionManager, SessionState, StartOutcome, TokenVerifier, TrustBridge,
};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn jwt(sub: &str, expires_at: OffsetDateTime) -> String {
    jsonwebtoken::encode(
        &Header::default(),
        &json!({
            "sub": sub,
            "exp": expires_at.unix_timestamp(),
            "iat": OffsetDateTime::now_utc().unix_timestamp(),
            "realm_access": { "roles": ["viewer"] }
        }),
        &EncodingKey::from_secret(b"test-secret"),
    )
    .unwrap()
}

fn in_secs(secs: i64) -> OffsetDateTime {
    OffsetDateTime::now_utc() + time::Duration::seconds(secs)
}

fn token_body(access_token: &str, refresh_token: &str, expires_in: u64) -> serde_json::Value {
    json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": expires_in,
        "refresh_token": refresh_token,
    })
}

fn pkce_manager(
    server: &MockServer,
    resume_refresh_token: &str,
    config: LifecycleConfig,
) -> SessionManager<PkceEstablisher> {
    init_tracing();
    let oauth = OAuthConfig::new(
        "test-client",
        "https://idp.example.com/realms/app".parse().unwrap(),
        "http://localhost:5175/callback".parse().unwrap(),
    )
    .with_token_url(format!("{}/token", server.uri()).parse().unwrap());

    let establisher = PkceEstablisher::new(AuthClient::new(oauth), TokenVerifier::unverified())
        .with_resume_refresh_token(resume_refresh_token);
    SessionManager::new(establisher, config)
}

fn backend_manager(base: &str) -> SessionManager<BackendEstablisher> {
    init_tracing();
    let establisher = BackendEstablisher::new(BackendConfig::new(base.parse().unwrap())).unwrap();
    SessionManager::new(establisher, LifecycleConfig::default())
}

#[tokio::test]
async fn concurrent_refresh_triggers_coalesce_to_one_exchange() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-initial"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(&jwt("user-1", in_secs(3600)), "rt-rotated", 3600)),
        )
        .expect(1)
        .mount(&server)
        .await;

    // Slow response so every trigger lands while the exchange is in flight.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-rotated"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(&jwt("user-1", in_secs(7200)), "rt-final", 7200))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = Arc::new(pkce_manager(&server, "rt-initial", LifecycleConfig::default()));
    assert!(matches!(
        manager.start().await.unwrap(),
        StartOutcome::Authenticated
    ));

    let mut triggers = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        triggers.push(tokio::spawn(async move { manager.refresh_now().await }));
    }
    for trigger in triggers {
        let credential = trigger.await.unwrap().unwrap();
        assert_eq!(credential.subject().as_str(), "user-1");
    }
    // expect(1) on each mock verifies the coalescing when the server drops.
}

#[tokio::test]
async fn refresh_fails_once_then_succeeds_within_policy() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-initial"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(&jwt("user-1", in_secs(3600)), "rt-next", 3600)),
        )
        .expect(1)
        .mount(&server)
        .await;

    // First renewal attempt: transient 5xx, consumed exactly once.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-next"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-next"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(&jwt("user-1", in_secs(7200)), "rt-later", 7200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = LifecycleConfig::new().with_retry(RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(50),
    });
    let manager = pkce_manager(&server, "rt-initial", config);
    manager.start().await.unwrap();

    let before = manager.store().credential().unwrap().expires_at().unwrap();
    let renewed = manager.refresh_now().await.unwrap();
    assert!(renewed.expires_at().unwrap() > before);
    assert!(manager.state().is_authenticated());
    // The two renewal mocks verify exactly two attempts were made.
}

#[tokio::test]
async fn exhausted_renewal_demotes_session_to_expired() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-initial"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(&jwt("user-1", in_secs(3600)), "rt-next", 3600)),
        )
        .mount(&server)
        .await;

    // Both bounded attempts fail; the grant only recovers afterwards.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-next"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-next"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(&jwt("user-1", in_secs(7200)), "rt-later", 7200)),
        )
        .mount(&server)
        .await;

    let config = LifecycleConfig::new().with_retry(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(20),
    });
    let manager = pkce_manager(&server, "rt-initial", config);
    manager.start().await.unwrap();

    let result = manager.refresh_now().await;
    assert!(matches!(result, Err(Error::Refresh { attempts: 2, .. })));
    assert!(matches!(manager.state(), SessionState::Expired));

    // Expired sessions may re-establish.
    assert!(matches!(
        manager.start().await.unwrap(),
        StartOutcome::Authenticated
    ));
}

#[tokio::test]
async fn scheduler_renews_ahead_of_expiry() {
    let server = MockServer::start().await;

    // Expires in 6s; with the 5s default lead the timer fires almost
    // immediately.
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-initial"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(&jwt("user-1", in_secs(6)), "rt-next", 6)),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("rt-next"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(&jwt("user-1", in_secs(3600)), "rt-later", 3600)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = pkce_manager(&server, "rt-initial", LifecycleConfig::default());
    let mut states = manager.subscribe();
    manager.start().await.unwrap();
    let initial_expiry = manager.store().credential().unwrap().expires_at().unwrap();

    let renewed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            states.changed().await.unwrap();
            let current = states.borrow_and_update().clone();
            if let Some(credential) = current.credential() {
                if credential.expires_at().unwrap() > initial_expiry {
                    break;
                }
            }
        }
    })
    .await;
    assert!(renewed.is_ok(), "scheduler never renewed the credential");
    manager.shutdown();
}

#[tokio::test]
async fn bridge_outside_authenticated_never_touches_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/exchange"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = CredentialStore::new();
    let bridge = TrustBridge::new(format!("{}/exchange", server.uri()).parse().unwrap());
    assert!(matches!(
        bridge.bridge(&store).await,
        Err(BridgeError::NotAuthenticated)
    ));
}

#[tokio::test]
async fn establish_then_bridge_preserves_subject() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "subject": "alice",
            "roles": { "roles": ["viewer"] },
            "name": "Alice",
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/exchange"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": jwt("alice", in_secs(3600)) })),
        )
        .mount(&server)
        .await;

    let establisher =
        BackendEstablisher::new(BackendConfig::new(server.uri().parse().unwrap())).unwrap();
    let bridge = TrustBridge::new(format!("{}/exchange", server.uri()).parse().unwrap())
        .with_http_client(establisher.http().clone());
    let manager = SessionManager::new(establisher, LifecycleConfig::default())
        .with_downstream(DownstreamAuth::Bridge(bridge));

    assert!(matches!(
        manager.start().await.unwrap(),
        StartOutcome::Authenticated
    ));

    let primary_subject = manager.store().credential().unwrap().subject().clone();
    let bridged = manager.bridge().await.unwrap();
    assert_eq!(bridged.subject(), &primary_subject);
    assert!(bridged.claims().has_role("viewer"));
}

#[tokio::test]
async fn bridge_retries_transient_failure_once() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/session"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "subject": "alice" })),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/exchange"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/exchange"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": jwt("alice", in_secs(3600)) })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let establisher =
        BackendEstablisher::new(BackendConfig::new(server.uri().parse().unwrap())).unwrap();
    let bridge = TrustBridge::new(format!("{}/exchange", server.uri()).parse().unwrap())
        .with_http_client(establisher.http().clone());
    let manager = SessionManager::new(establisher, LifecycleConfig::default())
        .with_downstream(DownstreamAuth::Bridge(bridge));

    manager.start().await.unwrap();
    assert!(manager.bridge().await.is_ok());
}

#[tokio::test]
async fn bridge_rejection_is_not_retried_and_leaves_session_intact() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/session"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "subject": "alice" })),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/exchange"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let establisher =
        BackendEstablisher::new(BackendConfig::new(server.uri().parse().unwrap())).unwrap();
    let bridge = TrustBridge::new(format!("{}/exchange", server.uri()).parse().unwrap())
        .with_http_client(establisher.http().clone());
    let manager = SessionManager::new(establisher, LifecycleConfig::default())
        .with_downstream(DownstreamAuth::Bridge(bridge));

    manager.start().await.unwrap();
    assert!(matches!(
        manager.bridge().await,
        Err(BridgeError::ExchangeRejected(403))
    ));
    // The primary session is untouched by a downstream-only failure.
    assert!(manager.state().is_authenticated());
}

#[tokio::test]
async fn probe_401_issues_exactly_one_login_redirect() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/session"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let manager = backend_manager(&server.uri());
    match manager.start().await.unwrap() {
        StartOutcome::LoginRequired { login_url } => {
            assert_eq!(login_url, format!("{}/login", server.uri()));
        }
        other => panic!("expected LoginRequired, got {other:?}"),
    }
    assert!(matches!(manager.state(), SessionState::Unauthenticated));
}

#[tokio::test]
async fn probe_failure_is_not_mistaken_for_logout() {
    // Nothing listens here: a transport error, not a 401.
    let manager = backend_manager("http://127.0.0.1:9");
    let result = manager.start().await;
    assert!(matches!(result, Err(Error::Http(_))));
    // Unauthenticated, but with no redirect indicated — the caller may
    // retry explicitly once the network recovers.
    assert!(matches!(manager.state(), SessionState::Unauthenticated));
}

#[tokio::test]
async fn establishment_runs_once_per_session_lifetime() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/session"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "subject": "alice" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let manager = backend_manager(&server.uri());
    manager.start().await.unwrap();
    assert!(matches!(
        manager.start().await,
        Err(Error::AlreadyEstablished { .. })
    ));
}

#[tokio::test]
async fn stale_access_token_call_demotes_session_lazily() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/session"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "subject": "alice" })),
        )
        .mount(&server)
        .await;

    // The cookie session lapsed server-side in the meantime.
    Mock::given(method("GET"))
        .and(path("/auth/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let manager = backend_manager(&server.uri());
    manager.start().await.unwrap();

    let result = manager.access_token().await;
    assert!(matches!(result, Err(Error::Authentication(_))));
    // Demoted, so the consumer restarts establishment.
    assert!(matches!(manager.state(), SessionState::Unauthenticated));
    assert!(manager.start().await.is_ok());
}

#[tokio::test]
async fn manual_refresh_is_inert_for_server_renewed_sessions() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/session"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "subject": "alice" })),
        )
        .mount(&server)
        .await;

    let manager = backend_manager(&server.uri());
    manager.start().await.unwrap();
    let before = manager.store().credential().unwrap();

    // The backend renews server-side; a manual trigger hands back the
    // current credential and must not invalidate the session.
    let after = manager.refresh_now().await.unwrap();
    assert_eq!(after.subject(), before.subject());
    assert!(manager.state().is_authenticated());
    assert_eq!(manager.refresh_phase(), RefreshPhase::Idle);
}

#[tokio::test]
async fn configured_check_sso_reaches_the_establisher() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    init_tracing();
    let oauth = OAuthConfig::new(
        "test-client",
        "https://idp.example.com/realms/app".parse().unwrap(),
        "http://localhost:5175/callback".parse().unwrap(),
    )
    .with_token_url(format!("{}/token", server.uri()).parse().unwrap());
    let establisher = PkceEstablisher::new(AuthClient::new(oauth), TokenVerifier::unverified());
    let config = LifecycleConfig::new().with_init_mode(InitMode::CheckExistingSession);
    let manager = SessionManager::new(establisher, config);

    // No saved session to resume and check-sso configured: a quiet
    // negative, not a forced login redirect.
    assert!(matches!(
        manager.start().await.unwrap(),
        StartOutcome::Unauthenticated
    ));
}

#[tokio::test]
async fn teardown_during_establish_mutates_nothing_afterwards() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/auth/session"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "subject": "bob" }))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let manager = Arc::new(backend_manager(&server.uri()));
    let mut spy = manager.subscribe();

    let starter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.start().await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    // Consume the Unauthenticated -> Establishing transition.
    spy.borrow_and_update();
    manager.shutdown();

    let result = starter.await.unwrap();
    assert!(result.is_err(), "late establish result must be dropped");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        !spy.has_changed().unwrap(),
        "state mutated after teardown"
    );
}

#[tokio::test]
async fn logout_clears_session_and_yields_provider_redirect() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(&jwt("user-1", in_secs(3600)), "rt-next", 3600)),
        )
        .mount(&server)
        .await;

    let manager = pkce_manager(&server, "rt-initial", LifecycleConfig::default());
    manager.start().await.unwrap();
    assert!(manager.state().is_authenticated());

    let redirect = manager.logout().await.unwrap();
    let redirect = redirect.expect("browser variant logout redirects to the provider");
    assert!(redirect.contains("logout"));
    assert!(matches!(manager.state(), SessionState::Unauthenticated));

    // Logged out: establishment may run again, now without a saved refresh
    // credential, so it asks for a login redirect.
    assert!(matches!(
        manager.start().await.unwrap(),
        StartOutcome::LoginRequired { .. }
    ));
}

#[tokio::test]
async fn anonymous_key_fallback_serves_downstream_bearer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/session"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "subject": "alice" })),
        )
        .mount(&server)
        .await;

    let manager = backend_manager(&server.uri())
        .with_downstream(DownstreamAuth::AnonymousKey("publishable-key".into()));
    manager.start().await.unwrap();
    assert_eq!(manager.downstream_bearer().await.unwrap(), "publishable-key");
    // But no bridged credential exists in this reduced-trust mode.
    assert!(manager.trust_bridge().is_none());
}
