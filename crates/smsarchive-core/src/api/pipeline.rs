//! Request pipeline that every authenticated call goes through.
//!
//! The outbound hook attaches the current access token. The inbound hook
//! turns a 401 into one refresh (shared with every other request that failed
//! at the same time) and exactly one resend.

use std::sync::Arc;

use reqwest::header::{self, HeaderValue};
use reqwest::{Client, Request, Response, StatusCode};
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{CredentialStore, RefreshCoordinator};

/// Execution context carried with a single logical request, across every
/// send it takes (token refresh and rate-limit resends alike).
pub(crate) struct Attempt {
    request: Request,
    /// Access token the next send will carry
    bearer: Option<String>,
    /// Session the request was started in
    epoch: u64,
    /// Set once the request has been resent after a refresh
    retried: bool,
}

enum Inbound {
    Done(Response),
    Resend(String),
}

/// Clone is cheap - everything inside is shared.
#[derive(Clone)]
pub struct RequestPipeline {
    client: Client,
    credentials: Arc<CredentialStore>,
    refresher: Arc<RefreshCoordinator>,
}

impl RequestPipeline {
    pub fn new(
        client: Client,
        credentials: Arc<CredentialStore>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            client,
            credentials,
            refresher,
        }
    }

    /// Underlying HTTP client, for building requests
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send a request, recovering from one expired access token.
    ///
    /// Non-401 responses come back untouched, including error statuses.
    /// A 401 on a request that was sent without a credential also comes
    /// back untouched. A 401 after the single resend is `RetryExhausted`.
    pub async fn execute(&self, request: Request) -> Result<Response, ApiError> {
        let mut attempt = self.begin(request);
        self.send(&mut attempt).await
    }

    pub(crate) fn begin(&self, request: Request) -> Attempt {
        let (bearer, epoch) = match self.credentials.snapshot() {
            Some((pair, epoch)) => (Some(pair.access_token().to_string()), epoch),
            None => (None, self.credentials.session_epoch()),
        };
        Attempt {
            request,
            bearer,
            epoch,
            retried: false,
        }
    }

    /// Send an attempt again. The `retried` flag survives between calls, so
    /// one logical request refreshes at most once however often it is sent.
    pub(crate) async fn send(&self, attempt: &mut Attempt) -> Result<Response, ApiError> {
        self.sync_bearer(attempt);
        loop {
            let response = self.dispatch(attempt).await?;
            match self.inspect(attempt, response).await? {
                Inbound::Done(response) => return Ok(response),
                Inbound::Resend(token) => attempt.bearer = Some(token),
            }
        }
    }

    /// Pick up a rotation that happened since the attempt last went out
    fn sync_bearer(&self, attempt: &mut Attempt) {
        if attempt.bearer.is_none() {
            return;
        }
        if let Some((pair, epoch)) = self.credentials.snapshot() {
            if epoch == attempt.epoch {
                attempt.bearer = Some(pair.access_token().to_string());
            }
        }
    }

    /// Outbound hook: a fresh copy of the request with the bearer attached
    fn prepare(&self, attempt: &Attempt) -> Result<Request, ApiError> {
        let mut request = attempt
            .request
            .try_clone()
            .ok_or(ApiError::RequestNotReplayable)?;

        if let Some(ref token) = attempt.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::MalformedCredential)?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
        }
        Ok(request)
    }

    async fn dispatch(&self, attempt: &Attempt) -> Result<Response, ApiError> {
        let request = self.prepare(attempt)?;
        debug!(
            method = %request.method(),
            url = %request.url(),
            authenticated = attempt.bearer.is_some(),
            retried = attempt.retried,
            "Sending request"
        );
        Ok(self.client.execute(request).await?)
    }

    /// Inbound hook
    async fn inspect(&self, attempt: &mut Attempt, response: Response) -> Result<Inbound, ApiError> {
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(Inbound::Done(response));
        }
        let Some(stale) = attempt.bearer.clone() else {
            return Ok(Inbound::Done(response));
        };
        if attempt.retried {
            warn!(url = %response.url(), "Request still unauthorized after token refresh");
            return Err(ApiError::RetryExhausted);
        }
        if self.credentials.session_epoch() != attempt.epoch {
            debug!(url = %response.url(), "Session changed while request was in flight");
            return Ok(Inbound::Done(response));
        }

        attempt.retried = true;
        debug!(url = %response.url(), "Access token rejected, refreshing");
        let pair = self.refresher.refresh(&stale).await?;
        Ok(Inbound::Resend(pair.access_token().to_string()))
    }
}
