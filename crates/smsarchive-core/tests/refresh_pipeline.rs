mod common;

use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use smsarchive_core::{ApiError, AuthStatus, KeyValueStore};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;

const ITEMS_PATH: &str = "/api/items";

async fn mount_items(server: &MockServer, token: &str, status: u16) {
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(header("Authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(status).set_body_json(json!({ "ok": status == 200 })))
        .mount(server)
        .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_401s_share_one_refresh() {
    let server = MockServer::start().await;
    mount_items(&server, "A1", 401).await;
    mount_items(&server, "A2", 200).await;
    refresh_mock("R1", "A2", "R2", Duration::from_millis(200))
        .expect(1)
        .mount(&server)
        .await;

    let (ctx, storage) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let calls = (0..5).map(|_| {
        let api = ctx.api.clone();
        async move { api.get::<serde_json::Value>(ITEMS_PATH).await }
    });
    let results = join_all(calls).await;

    for result in results {
        assert_eq!(result.unwrap(), json!({ "ok": true }));
    }

    let current = ctx.credentials.get().unwrap();
    assert_eq!(current.access_token(), "A2");
    assert_eq!(current.refresh_token(), "R2");
    assert_eq!(storage.get("accessToken").unwrap().as_deref(), Some("A2"));
    assert_eq!(ctx.refresher.cycles_started(), 1);
    assert!(!ctx.refresher.in_flight());
    assert_eq!(ctx.credentials.status(), AuthStatus::Authenticated);

    // Every request was sent once with the old token and once with the new one
    let bearers = bearers_for(&server, ITEMS_PATH).await;
    assert_eq!(bearers.len(), 10);
    assert_eq!(bearers.iter().filter(|b| *b == "Bearer A1").count(), 5);
    assert_eq!(bearers.iter().filter(|b| *b == "Bearer A2").count(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_callers_see_same_pair() {
    let server = MockServer::start().await;
    refresh_mock("R1", "A2", "R2", Duration::from_millis(100))
        .expect(1)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let refreshes = (0..8).map(|_| ctx.refresher.refresh("A1"));
    let results = join_all(refreshes).await;

    for result in results {
        let pair = result.unwrap();
        assert_eq!(pair.access_token(), "A2");
        assert_eq!(pair.refresh_token(), "R2");
    }
    assert_eq!(ctx.refresher.cycles_started(), 1);
}

#[tokio::test]
async fn test_stale_token_skips_refresh() {
    let server = MockServer::start().await;
    refresh_mock("R2", "A3", "R3", Duration::ZERO)
        .expect(0)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A2", "R2")).unwrap();

    // A request that went out with A1 before the last rotation
    let current = ctx.refresher.refresh("A1").await.unwrap();
    assert_eq!(current.access_token(), "A2");
    assert_eq!(ctx.refresher.cycles_started(), 0);
}

#[tokio::test]
async fn test_refresh_without_credentials_is_missing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    let result = ctx.refresher.refresh("A1").await;
    assert!(matches!(result, Err(ApiError::CredentialMissing)));
}

#[tokio::test]
async fn test_second_401_is_retry_exhausted() {
    let server = MockServer::start().await;
    mount_items(&server, "A1", 401).await;
    mount_items(&server, "A2", 401).await;
    refresh_mock("R1", "A2", "R2", Duration::ZERO)
        .expect(1)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let result = ctx.api.get::<serde_json::Value>(ITEMS_PATH).await;
    assert!(matches!(result, Err(ApiError::RetryExhausted)));

    // The refresh itself succeeded, so the new pair stays
    assert_eq!(ctx.credentials.access_token().as_deref(), Some("A2"));
    assert_eq!(bearers_for(&server, ITEMS_PATH).await, vec!["Bearer A1", "Bearer A2"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_refresh_ends_session_for_every_waiter() {
    let server = MockServer::start().await;
    mount_items(&server, "A1", 401).await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "error": "Invalid refresh token" }))
                .set_delay(Duration::from_millis(150)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (ctx, storage) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let calls = (0..4).map(|_| {
        let api = ctx.api.clone();
        async move { api.get::<serde_json::Value>(ITEMS_PATH).await }
    });
    let results = join_all(calls).await;

    for result in results {
        let err = result.unwrap_err();
        assert!(err.is_session_ended(), "unexpected error: {}", err);
    }

    assert!(ctx.credentials.get().is_none());
    assert_eq!(ctx.credentials.status(), AuthStatus::Idle);
    assert_eq!(storage.get("accessToken").unwrap(), None);
    assert_eq!(storage.get("refreshToken").unwrap(), None);
    assert!(!ctx.refresher.in_flight());
}

#[tokio::test]
async fn test_refresh_network_failure_clears_pair() {
    // Nothing listens on the discard port
    let ctx = smsarchive_core::ArchiveContext::with_client(
        reqwest::Client::new(),
        "http://127.0.0.1:9",
        std::sync::Arc::new(smsarchive_core::MemoryStore::new()),
    );
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let result = ctx.refresher.refresh("A1").await;
    assert!(matches!(result, Err(ApiError::RefreshFailed(_))));
    assert!(ctx.credentials.get().is_none());
    assert_eq!(ctx.credentials.status(), AuthStatus::Idle);
}

#[tokio::test]
async fn test_refresh_after_failure_starts_new_cycle() {
    let server = MockServer::start().await;
    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();
    assert!(ctx.refresher.refresh("A1").await.is_err());

    refresh_mock("R5", "A6", "R6", Duration::ZERO)
        .expect(1)
        .mount(&server)
        .await;
    ctx.credentials.start_session(pair("A5", "R5")).unwrap();

    let pair = ctx.refresher.refresh("A5").await.unwrap();
    assert_eq!(pair.access_token(), "A6");
    assert_eq!(ctx.refresher.cycles_started(), 2);
}

#[tokio::test]
async fn test_non_401_errors_pass_through() {
    let server = MockServer::start().await;
    mount_items(&server, "A1", 500).await;
    Mock::given(method("GET"))
        .and(path("/api/forbidden"))
        .respond_with(ResponseTemplate::new(403).set_body_string("not yours"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let result = ctx.api.get::<serde_json::Value>(ITEMS_PATH).await;
    assert!(matches!(result, Err(ApiError::ServerError(_))));

    let result = ctx.api.get::<serde_json::Value>("/api/forbidden").await;
    assert!(matches!(result, Err(ApiError::AccessDenied(ref body)) if body == "not yours"));

    assert_eq!(ctx.credentials.access_token().as_deref(), Some("A1"));
}

#[tokio::test]
async fn test_unauthenticated_401_passes_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    let result = ctx.api.get::<serde_json::Value>(ITEMS_PATH).await;
    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert!(bearers_for(&server, ITEMS_PATH).await.is_empty());
}

#[tokio::test]
async fn test_post_body_is_resent_after_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ITEMS_PATH))
        .and(header("Authorization", "Bearer A1"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ITEMS_PATH))
        .and(header("Authorization", "Bearer A2"))
        .and(body_json(json!({ "name": "inbox" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1 })))
        .expect(1)
        .mount(&server)
        .await;
    refresh_mock("R1", "A2", "R2", Duration::ZERO)
        .expect(1)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let created: serde_json::Value = ctx
        .api
        .post(ITEMS_PATH, &json!({ "name": "inbox" }))
        .await
        .unwrap();
    assert_eq!(created, json!({ "id": 1 }));
}

#[tokio::test]
async fn test_rate_limit_backs_off_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);

    // Backoff sleeps run on the paused clock; the mock server keeps real time
    tokio::time::pause();
    let started = tokio::time::Instant::now();
    let value: serde_json::Value = ctx.api.get(ITEMS_PATH).await.unwrap();

    assert_eq!(value, json!({ "ok": true }));
    assert!(started.elapsed() >= Duration::from_millis(1000 + 2000));
}

#[tokio::test]
async fn test_rate_limited_resend_after_refresh_does_not_refresh_again() {
    let server = MockServer::start().await;
    mount_items(&server, "A1", 401).await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(header("Authorization", "Bearer A2"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_items(&server, "A2", 401).await;
    refresh_mock("R1", "A2", "R2", Duration::ZERO)
        .expect(1)
        .mount(&server)
        .await;
    refresh_mock("R2", "A3", "R3", Duration::ZERO)
        .expect(0)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    tokio::time::pause();
    let result = ctx.api.get::<serde_json::Value>(ITEMS_PATH).await;

    assert!(matches!(result, Err(ApiError::RetryExhausted)));
    assert_eq!(ctx.refresher.cycles_started(), 1);
    assert_eq!(ctx.credentials.access_token().as_deref(), Some("A2"));
    assert_eq!(
        bearers_for(&server, ITEMS_PATH).await,
        vec!["Bearer A1", "Bearer A2", "Bearer A2"]
    );
}

#[tokio::test]
async fn test_401_after_rotation_resends_with_current_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(header("Authorization", "Bearer A1"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;
    mount_items(&server, "A2", 200).await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("A3", "R3")))
        .expect(0)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    // Another caller rotates the pair while the A1 request is still out
    let rotate = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.credentials.set(pair("A2", "R2")).unwrap();
    };
    let (result, ()) = tokio::join!(ctx.api.get::<serde_json::Value>(ITEMS_PATH), rotate);

    assert_eq!(result.unwrap(), json!({ "ok": true }));
    assert_eq!(ctx.refresher.cycles_started(), 0);
    assert_eq!(bearers_for(&server, ITEMS_PATH).await, vec!["Bearer A1", "Bearer A2"]);
}

// ===== Session changes during a refresh =====

async fn mount_bob_login(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({ "username": "bob", "password": "hunter22" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("B1", "S1")))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(ME_PATH))
        .and(header("Authorization", "Bearer B1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(profile_body("bob")))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_failed_refresh_from_previous_session_keeps_new_login() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(
            ResponseTemplate::new(400)
                .set_body_json(json!({ "error": "Invalid refresh token" }))
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_bob_login(&server).await;

    let (ctx, storage) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let relogin = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.session.logout().unwrap();
        ctx.session.login("bob", "hunter22").await.unwrap();
    };
    let (old_refresh, ()) = tokio::join!(ctx.refresher.refresh("A1"), relogin);

    assert!(matches!(old_refresh, Err(ApiError::RefreshFailed(_))));
    assert_eq!(ctx.credentials.access_token().as_deref(), Some("B1"));
    assert_eq!(ctx.credentials.status(), AuthStatus::Authenticated);
    assert_eq!(ctx.session.user().unwrap().username, "bob");
    assert_eq!(storage.get("refreshToken").unwrap().as_deref(), Some("S1"));
    assert!(!ctx.refresher.in_flight());
}

#[tokio::test]
async fn test_successful_refresh_from_previous_session_is_discarded() {
    let server = MockServer::start().await;
    refresh_mock("R1", "A2", "R2", Duration::from_millis(500))
        .expect(1)
        .mount(&server)
        .await;
    mount_bob_login(&server).await;

    let (ctx, storage) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let relogin = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.session.logout().unwrap();
        ctx.session.login("bob", "hunter22").await.unwrap();
    };
    let (old_refresh, ()) = tokio::join!(ctx.refresher.refresh("A1"), relogin);

    // The old caller learns its session is gone; bob's pair is untouched
    assert!(old_refresh.unwrap_err().is_session_ended());
    assert_eq!(ctx.credentials.access_token().as_deref(), Some("B1"));
    assert_eq!(storage.get("accessToken").unwrap().as_deref(), Some("B1"));
    assert_eq!(ctx.session.user().unwrap().username, "bob");
}

#[tokio::test]
async fn test_new_session_does_not_join_previous_session_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .and(body_json(json!({ "refreshToken": "R1" })))
        .respond_with(ResponseTemplate::new(400).set_delay(Duration::from_millis(500)))
        .expect(1)
        .mount(&server)
        .await;
    refresh_mock("S1", "B2", "S2", Duration::ZERO)
        .expect(1)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let new_session = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.credentials.start_session(pair("B1", "S1")).unwrap();
        ctx.refresher.refresh("B1").await
    };
    let (old_refresh, new_refresh) = tokio::join!(ctx.refresher.refresh("A1"), new_session);

    assert!(old_refresh.is_err());
    assert_eq!(new_refresh.unwrap().access_token(), "B2");
    assert_eq!(ctx.credentials.access_token().as_deref(), Some("B2"));
    assert_eq!(ctx.refresher.cycles_started(), 2);
    assert!(!ctx.refresher.in_flight());
}

#[tokio::test]
async fn test_401_for_replaced_session_is_not_refreshed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .and(header("Authorization", "Bearer A1"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body("X1", "Y1")))
        .expect(0)
        .mount(&server)
        .await;

    let (ctx, _) = context(&server);
    ctx.credentials.start_session(pair("A1", "R1")).unwrap();

    let relogin = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.credentials.start_session(pair("B1", "S1")).unwrap();
    };
    let (result, ()) = tokio::join!(ctx.api.get::<serde_json::Value>(ITEMS_PATH), relogin);

    assert!(matches!(result, Err(ApiError::Unauthorized)));
    assert_eq!(ctx.refresher.cycles_started(), 0);
    assert_eq!(ctx.credentials.access_token().as_deref(), Some("B1"));
}
