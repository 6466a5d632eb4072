use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::credentials::{AuthStatus, CredentialPair, CredentialStore};
use super::refresh::RefreshCoordinator;
use crate::api::{ApiClient, ApiError, AuthApi};
use crate::models::UserProfile;

/// Minimum secret length accepted by the registration endpoint
const MIN_SECRET_LENGTH: usize = 6;

#[derive(Debug, Clone, Copy)]
enum AuthFlow {
    Login,
    Register,
}

impl AuthFlow {
    fn name(&self) -> &'static str {
        match self {
            AuthFlow::Login => "login",
            AuthFlow::Register => "register",
        }
    }
}

/// Drives the auth status state machine.
///
/// ```text
/// Idle/Error --login/register--> Authenticating --ok--> Authenticated
///                                               --err--> Error
/// Authenticated --logout--> Idle
/// any --refresh ok--> Authenticated, --refresh err--> Idle
/// ```
pub struct AuthSession {
    api: AuthApi,
    client: ApiClient,
    credentials: Arc<CredentialStore>,
    refresher: Arc<RefreshCoordinator>,
}

impl AuthSession {
    pub fn new(
        api: AuthApi,
        client: ApiClient,
        credentials: Arc<CredentialStore>,
        refresher: Arc<RefreshCoordinator>,
    ) -> Self {
        Self {
            api,
            client,
            credentials,
            refresher,
        }
    }

    pub async fn login(&self, username: &str, secret: &str) -> Result<Option<UserProfile>, ApiError> {
        self.authenticate(AuthFlow::Login, username, secret).await
    }

    pub async fn register(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<Option<UserProfile>, ApiError> {
        self.authenticate(AuthFlow::Register, username, secret).await
    }

    /// Shared login/register flow. Returns the profile if it could be fetched.
    async fn authenticate(
        &self,
        flow: AuthFlow,
        username: &str,
        secret: &str,
    ) -> Result<Option<UserProfile>, ApiError> {
        let username = username.trim();
        self.credentials.begin_authenticating();

        if let Err(e) = Self::validate(flow, username, secret) {
            let _ = self.credentials.fail();
            return Err(e);
        }

        let result = match flow {
            AuthFlow::Login => self.api.login(username, secret).await,
            AuthFlow::Register => self.api.register(username, secret).await,
        };

        let pair = match result {
            Ok(pair) => pair,
            Err(e) => {
                error!(flow = flow.name(), error = %e, "Authentication failed");
                let _ = self.credentials.fail();
                return Err(e);
            }
        };

        if let Err(e) = self.credentials.start_session(pair) {
            error!(flow = flow.name(), error = %e, "Failed to store credentials");
            let _ = self.credentials.fail();
            return Err(e.into());
        }

        info!(flow = flow.name(), username, "Authenticated");
        Ok(self.load_profile().await)
    }

    fn validate(flow: AuthFlow, username: &str, secret: &str) -> Result<(), ApiError> {
        if username.is_empty() || secret.is_empty() {
            return Err(ApiError::BadRequest(
                "Username and password required".to_string(),
            ));
        }
        if matches!(flow, AuthFlow::Register) && secret.chars().count() < MIN_SECRET_LENGTH {
            return Err(ApiError::BadRequest(format!(
                "Password must be at least {} characters",
                MIN_SECRET_LENGTH
            )));
        }
        Ok(())
    }

    /// End the session locally
    pub fn logout(&self) -> Result<(), ApiError> {
        self.credentials.clear()?;
        info!("Logged out");
        Ok(())
    }

    /// Refresh the current pair now.
    ///
    /// On failure the session has ended: credentials are cleared and the
    /// status is Idle. Callers should send the user back to login rather
    /// than retry.
    pub async fn refresh(&self) -> Result<CredentialPair, ApiError> {
        let current = self
            .credentials
            .access_token()
            .ok_or(ApiError::CredentialMissing)?;
        let pair = self.refresher.refresh(&current).await?;
        self.load_profile().await;
        Ok(pair)
    }

    /// Restore the stored session at startup.
    ///
    /// Returns true if a session was restored. The profile is fetched only
    /// when a well-formed pair was found.
    pub async fn hydrate(&self) -> Result<bool, ApiError> {
        if self.credentials.load()?.is_none() {
            return Ok(false);
        }
        self.load_profile().await;
        Ok(self.credentials.get().is_some())
    }

    /// Fetch the profile through the pipeline, without caching it
    pub async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        self.client.fetch_profile().await.map_err(|e| {
            if e.is_session_ended() || matches!(e, ApiError::RetryExhausted) {
                e
            } else {
                ApiError::ProfileFetchFailed(e.to_string())
            }
        })
    }

    /// Best-effort profile fetch. The credential pair stays valid whatever
    /// happens here.
    async fn load_profile(&self) -> Option<UserProfile> {
        let epoch = self.credentials.session_epoch();
        match self.fetch_profile().await {
            Ok(profile) => {
                if self.credentials.set_user(profile.clone(), epoch) {
                    Some(profile)
                } else {
                    None
                }
            }
            Err(e) => {
                warn!(error = %e, "Ignoring profile fetch failure");
                None
            }
        }
    }

    pub fn status(&self) -> AuthStatus {
        self.credentials.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.credentials.subscribe()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.credentials.user()
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_username_and_secret() {
        assert!(AuthSession::validate(AuthFlow::Login, "", "secret").is_err());
        assert!(AuthSession::validate(AuthFlow::Login, "alice", "").is_err());
        assert!(AuthSession::validate(AuthFlow::Login, "alice", "x").is_ok());
    }

    #[test]
    fn test_validate_register_secret_length() {
        assert!(matches!(
            AuthSession::validate(AuthFlow::Register, "alice", "12345"),
            Err(ApiError::BadRequest(_))
        ));
        assert!(AuthSession::validate(AuthFlow::Register, "alice", "123456").is_ok());
    }
}
