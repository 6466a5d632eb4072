#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use smsarchive_core::{ArchiveContext, CredentialPair, KeyValueStore, MemoryStore};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const REFRESH_PATH: &str = "/api/auth/refresh";
pub const ME_PATH: &str = "/api/auth/me";

pub fn context(server: &MockServer) -> (ArchiveContext, Arc<MemoryStore>) {
    let storage = Arc::new(MemoryStore::new());
    let ctx = ArchiveContext::with_client(reqwest::Client::new(), &server.uri(), storage.clone());
    (ctx, storage)
}

pub fn context_with(server: &MockServer, storage: Arc<dyn KeyValueStore>) -> ArchiveContext {
    ArchiveContext::with_client(reqwest::Client::new(), &server.uri(), storage)
}

pub fn pair(access: &str, refresh: &str) -> CredentialPair {
    CredentialPair::new(access, refresh).unwrap()
}

pub fn token_body(access: &str, refresh: &str) -> serde_json::Value {
    json!({ "accessToken": access, "refreshToken": refresh })
}

pub fn profile_body(username: &str) -> serde_json::Value {
    json!({
        "id": "0b6f3c4e-8a21-4d9e-9a57-3e2f1c0d9b8a",
        "username": username,
        "createdAt": "2024-03-01T12:00:00Z",
        "updatedAt": "2024-03-02T12:00:00Z"
    })
}

/// Refresh endpoint that trades `refresh` for the given pair after `delay`
pub fn refresh_mock(refresh: &str, new_access: &str, new_refresh: &str, delay: Duration) -> Mock {
    Mock::given(method("POST"))
        .and(path(REFRESH_PATH))
        .and(body_json(json!({ "refreshToken": refresh })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(token_body(new_access, new_refresh))
                .set_delay(delay),
        )
}

/// Bearer tokens seen on requests to `request_path`, in arrival order
pub async fn bearers_for(server: &MockServer, request_path: &str) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == request_path)
        .filter_map(|r| {
            r.headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.to_string())
        })
        .collect()
}
