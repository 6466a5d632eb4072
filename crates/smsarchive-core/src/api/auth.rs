//! Unauthenticated calls to the `/api/auth` endpoints.
//!
//! Login, registration and refresh bypass the request pipeline: a 401 from
//! these endpoints means the submitted secret is wrong, not that an access
//! token expired, so it must never trigger a refresh.

use reqwest::{header, Client, StatusCode};
use serde::Serialize;
use tracing::debug;

use super::ApiError;
use crate::auth::CredentialPair;

const LOGIN_PATH: &str = "/api/auth/login";
const REGISTER_PATH: &str = "/api/auth/register";
const REFRESH_PATH: &str = "/api/auth/refresh";
pub(crate) const ME_PATH: &str = "/api/auth/me";

#[derive(Serialize)]
struct AuthRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthApi {
    client: Client,
    base_url: String,
}

impl AuthApi {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Exchange username and secret for a credential pair
    pub async fn login(&self, username: &str, secret: &str) -> Result<CredentialPair, ApiError> {
        self.submit_credentials(LOGIN_PATH, username, secret).await
    }

    /// Create an account and return its first credential pair
    pub async fn register(&self, username: &str, secret: &str) -> Result<CredentialPair, ApiError> {
        self.submit_credentials(REGISTER_PATH, username, secret).await
    }

    /// Trade a refresh token for a new pair
    pub async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, ApiError> {
        let url = format!("{}{}", self.base_url, REFRESH_PATH);
        debug!("Requesting token refresh");

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&RefreshRequest { refresh_token })
            .send()
            .await?;

        Self::parse_pair(response).await
    }

    async fn submit_credentials(
        &self,
        path: &str,
        username: &str,
        secret: &str,
    ) -> Result<CredentialPair, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(path, username, "Submitting credentials");

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/json")
            .json(&AuthRequest {
                username,
                password: secret,
            })
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ApiError::InvalidCredentials);
        }
        Self::parse_pair(response).await
    }

    async fn parse_pair(response: reqwest::Response) -> Result<CredentialPair, ApiError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ApiError::from_status(status, &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ApiError::InvalidResponse(format!("Malformed token response: {}", e)))
    }
}
