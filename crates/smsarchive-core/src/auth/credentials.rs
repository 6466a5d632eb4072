use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::storage::{KeyValueStore, StorageError};
use crate::models::UserProfile;

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

// ============================================================================
// Credential Pair
// ============================================================================

/// Access/refresh bearer pair. Both halves are always present.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "RawPair")]
pub struct CredentialPair {
    access_token: String,
    refresh_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPair {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

impl TryFrom<RawPair> for CredentialPair {
    type Error = String;

    fn try_from(raw: RawPair) -> Result<Self, Self::Error> {
        match (raw.access_token, raw.refresh_token) {
            (Some(access), Some(refresh)) => CredentialPair::new(access, refresh)
                .ok_or_else(|| "token is empty or contains invalid characters".to_string()),
            _ => Err("accessToken and refreshToken are both required".to_string()),
        }
    }
}

impl CredentialPair {
    /// Build a pair, rejecting tokens that could not travel in a header.
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Option<Self> {
        let access_token = access_token.into();
        let refresh_token = refresh_token.into();
        if is_well_formed(&access_token) && is_well_formed(&refresh_token) {
            Some(Self {
                access_token,
                refresh_token,
            })
        } else {
            None
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }
}

// Secrets stay out of logs
impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Non-empty, visible ASCII only.
fn is_well_formed(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_graphic())
}

// ============================================================================
// Auth Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthStatus {
    /// No credential attempt this session, or the session ended
    #[default]
    Idle,
    /// Login, registration or refresh in flight
    Authenticating,
    /// Valid credential pair held
    Authenticated,
    /// Last login or registration failed
    Error,
}

impl AuthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            AuthStatus::Idle => "idle",
            AuthStatus::Authenticating => "authenticating",
            AuthStatus::Authenticated => "authenticated",
            AuthStatus::Error => "error",
        }
    }
}

impl fmt::Display for AuthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Credential Store
// ============================================================================

#[derive(Default)]
struct CredentialState {
    pair: Option<CredentialPair>,
    user: Option<UserProfile>,
    /// Bumped whenever the account behind the pair may change
    epoch: u64,
}

/// Single writer of the credential pair.
///
/// Writers are serialized by `write_lock`, which is held across the storage
/// write and the in-memory swap. Readers only touch `state`, which is never
/// held during I/O, so `get` does not wait on disk or keychain access.
pub struct CredentialStore {
    storage: Arc<dyn KeyValueStore>,
    write_lock: Mutex<()>,
    state: RwLock<CredentialState>,
    status: watch::Sender<AuthStatus>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        let (status, _) = watch::channel(AuthStatus::Idle);
        Self {
            storage,
            write_lock: Mutex::new(()),
            state: RwLock::new(CredentialState::default()),
            status,
        }
    }

    /// Current credential pair, if any
    pub fn get(&self) -> Option<CredentialPair> {
        self.read_state().pair.clone()
    }

    /// Current access token, if any
    pub fn access_token(&self) -> Option<String> {
        self.read_state()
            .pair
            .as_ref()
            .map(|pair| pair.access_token.clone())
    }

    /// Persist and install a new pair for the same account (refresh).
    /// Memory is only updated once the storage write succeeded.
    pub fn set(&self, pair: CredentialPair) -> Result<(), StorageError> {
        let _writer = self.lock_writer();
        self.install(pair, false)
    }

    /// Persist and install the first pair of a new login or registration.
    /// Any cached profile from a previous account is dropped.
    pub fn start_session(&self, pair: CredentialPair) -> Result<(), StorageError> {
        let _writer = self.lock_writer();
        self.install(pair, true)
    }

    /// `set`, but only while `epoch` is still the current session.
    ///
    /// Returns false and changes nothing if the session was cleared or
    /// replaced in the meantime.
    pub fn set_for_session(&self, pair: CredentialPair, epoch: u64) -> Result<bool, StorageError> {
        let _writer = self.lock_writer();
        if self.read_state().epoch != epoch {
            return Ok(false);
        }
        self.install(pair, false)?;
        Ok(true)
    }

    /// `clear`, but only while `epoch` is still the current session.
    pub fn clear_for_session(&self, epoch: u64) -> Result<bool, StorageError> {
        let _writer = self.lock_writer();
        if self.read_state().epoch != epoch {
            return Ok(false);
        }
        self.clear_with_status(AuthStatus::Idle)?;
        Ok(true)
    }

    /// Current pair and the session it belongs to, read together
    pub fn snapshot(&self) -> Option<(CredentialPair, u64)> {
        let state = self.read_state();
        state.pair.clone().map(|pair| (pair, state.epoch))
    }

    /// Caller holds the writer lock.
    fn install(&self, pair: CredentialPair, new_session: bool) -> Result<(), StorageError> {
        self.storage.set_entries(&[
            (ACCESS_TOKEN_KEY, pair.access_token.as_str()),
            (REFRESH_TOKEN_KEY, pair.refresh_token.as_str()),
        ])?;

        let mut state = self.write_state();
        state.pair = Some(pair);
        if new_session {
            state.user = None;
            state.epoch += 1;
        }
        self.status.send_replace(AuthStatus::Authenticated);
        debug!(new_session, "Credential pair stored");
        Ok(())
    }

    /// Forget the pair and the cached profile; status becomes Idle
    pub fn clear(&self) -> Result<(), StorageError> {
        let _writer = self.lock_writer();
        self.clear_with_status(AuthStatus::Idle)
    }

    /// Like `clear`, but leaves the status at Error (failed login/register)
    pub fn fail(&self) -> Result<(), StorageError> {
        let _writer = self.lock_writer();
        self.clear_with_status(AuthStatus::Error)
    }

    /// Caller holds the writer lock.
    fn clear_with_status(&self, status: AuthStatus) -> Result<(), StorageError> {
        let removed = self
            .storage
            .remove_entries(&[ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY]);

        // Memory is cleared even if storage could not be; a stale stored
        // pair is rejected by the server on next start.
        let mut state = self.write_state();
        state.pair = None;
        state.user = None;
        state.epoch += 1;
        self.status.send_replace(status);
        drop(state);

        if let Err(ref e) = removed {
            warn!(error = %e, "Failed to remove stored credentials");
        }
        removed
    }

    /// Hydrate from storage once at startup.
    ///
    /// A missing or malformed stored value clears everything and returns
    /// `None`; otherwise the pair is installed and returned.
    pub fn load(&self) -> Result<Option<CredentialPair>, StorageError> {
        let stored = self.read_stored();
        let pair = match stored {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                debug!("No stored session");
                self.clear()?;
                return Ok(None);
            }
            Err(e) => {
                warn!(error = %e, "Stored session unreadable, clearing");
                self.clear()?;
                return Ok(None);
            }
        };

        let _writer = self.lock_writer();
        let mut state = self.write_state();
        state.pair = Some(pair.clone());
        self.status.send_replace(AuthStatus::Authenticated);
        info!("Session restored from storage");
        Ok(Some(pair))
    }

    fn read_stored(&self) -> Result<Option<CredentialPair>, StorageError> {
        let access = self.storage.get(ACCESS_TOKEN_KEY)?;
        let refresh = self.storage.get(REFRESH_TOKEN_KEY)?;
        Ok(match (access, refresh) {
            (Some(access), Some(refresh)) => {
                let pair = CredentialPair::new(access, refresh);
                if pair.is_none() {
                    warn!("Stored credential pair is malformed");
                }
                pair
            }
            _ => None,
        })
    }

    pub fn status(&self) -> AuthStatus {
        *self.status.borrow()
    }

    /// Receive every status transition from now on
    pub fn subscribe(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }

    /// Mark a login, registration or refresh as in flight
    pub fn begin_authenticating(&self) {
        self.status.send_replace(AuthStatus::Authenticating);
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.read_state().user.clone()
    }

    /// Identifies the current session; compare before caching a profile
    /// that was fetched asynchronously.
    pub fn session_epoch(&self) -> u64 {
        self.read_state().epoch
    }

    /// Cache a fetched profile, unless the session it was fetched for has
    /// since been cleared or replaced.
    pub fn set_user(&self, user: UserProfile, epoch: u64) -> bool {
        let mut state = self.write_state();
        let current = state.epoch == epoch && state.pair.is_some();
        if current {
            state.user = Some(user);
        }
        current
    }

    fn lock_writer(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, CredentialState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, CredentialState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
