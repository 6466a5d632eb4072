//! Single-flight credential refresh.
//!
//! Any number of requests can hit a 401 at the same moment. The first one to
//! reach the coordinator starts the refresh call; everyone else joins the
//! same shared future and observes the exact same outcome. A failed refresh
//! clears the credential pair and is never retried on its own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use super::credentials::{CredentialPair, CredentialStore};
use crate::api::{ApiError, AuthApi};

/// Outcome every waiter of one refresh cycle receives. The error is a
/// message because `ApiError` wraps non-clonable transport errors.
type RefreshOutcome = Result<CredentialPair, String>;

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

const SESSION_REPLACED: &str = "session was logged out or replaced during refresh";

enum RefreshState {
    Idle,
    InFlight {
        cycle: u64,
        /// Session the cycle was started for
        epoch: u64,
        /// Access token the cycle replaces
        replaces: String,
        outcome: SharedRefresh,
    },
}

pub struct RefreshCoordinator {
    credentials: Arc<CredentialStore>,
    api: AuthApi,
    state: Arc<Mutex<RefreshState>>,
    cycles: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(credentials: Arc<CredentialStore>, api: AuthApi) -> Self {
        Self {
            credentials,
            api,
            state: Arc::new(Mutex::new(RefreshState::Idle)),
            cycles: AtomicU64::new(0),
        }
    }

    /// Obtain a pair newer than `stale_access_token`.
    ///
    /// Joins the in-flight refresh if there is one. If the stored access
    /// token already differs from the stale one, another caller refreshed in
    /// the meantime and the current pair is returned without a network call.
    pub async fn refresh(&self, stale_access_token: &str) -> Result<CredentialPair, ApiError> {
        let outcome = {
            let mut state = lock(&self.state);
            let Some((current, epoch)) = self.credentials.snapshot() else {
                debug!("No credentials to refresh");
                return Err(ApiError::CredentialMissing);
            };

            // Only join a cycle for this session whose result is not yet
            // stored; once it is, a 401 on the new token needs a new cycle
            let joined = match &*state {
                RefreshState::InFlight {
                    cycle,
                    epoch: cycle_epoch,
                    replaces,
                    outcome,
                } if *cycle_epoch == epoch && replaces == current.access_token() => {
                    Some((*cycle, outcome.clone()))
                }
                _ => None,
            };

            if let Some((cycle, outcome)) = joined {
                debug!(cycle, "Joining in-flight token refresh");
                outcome
            } else if current.access_token() != stale_access_token {
                debug!("Access token already rotated, skipping refresh");
                return Ok(current);
            } else {
                let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
                let outcome = self.start(cycle, epoch, current.refresh_token().to_string());
                *state = RefreshState::InFlight {
                    cycle,
                    epoch,
                    replaces: stale_access_token.to_string(),
                    outcome: outcome.clone(),
                };
                outcome
            }
        };

        outcome.await.map_err(ApiError::RefreshFailed)
    }

    /// Is a refresh call currently running
    pub fn in_flight(&self) -> bool {
        matches!(*lock(&self.state), RefreshState::InFlight { .. })
    }

    /// Number of refresh calls started so far
    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Build the shared refresh future. Nothing runs until the first waiter
    /// polls it, which happens after the state lock is released.
    ///
    /// The cycle belongs to the session identified by `epoch`. If that
    /// session is logged out or replaced before the call returns, the result
    /// only settles the waiters and leaves the credential store alone.
    fn start(&self, cycle: u64, epoch: u64, refresh_token: String) -> SharedRefresh {
        let api = self.api.clone();
        let credentials = Arc::clone(&self.credentials);
        let state = Arc::downgrade(&self.state);

        info!(cycle, "Starting token refresh");
        self.credentials.begin_authenticating();

        async move {
            let result = api.refresh(&refresh_token).await;
            let outcome = apply(cycle, epoch, &credentials, result);
            if let Some(state) = state.upgrade() {
                let mut state = lock(&state);
                // A newer session may already own the slot
                if matches!(*state, RefreshState::InFlight { cycle: current, .. } if current == cycle) {
                    *state = RefreshState::Idle;
                }
            }
            outcome
        }
        .boxed()
        .shared()
    }
}

/// Write a refresh result to the credential store. Runs outside the state
/// lock; callers arriving meanwhile still join this cycle's outcome.
fn apply(
    cycle: u64,
    epoch: u64,
    credentials: &CredentialStore,
    result: Result<CredentialPair, ApiError>,
) -> RefreshOutcome {
    match result {
        Ok(pair) => match credentials.set_for_session(pair.clone(), epoch) {
            Ok(true) => {
                info!(cycle, "Token refresh succeeded");
                Ok(pair)
            }
            Ok(false) => {
                debug!(cycle, "Session changed during refresh, discarding result");
                Err(SESSION_REPLACED.to_string())
            }
            Err(e) => {
                warn!(cycle, error = %e, "Could not persist refreshed credentials, ending session");
                let _ = credentials.clear_for_session(epoch);
                Err(format!("could not store refreshed credentials: {}", e))
            }
        },
        Err(e) => {
            match credentials.clear_for_session(epoch) {
                Ok(false) => debug!(cycle, error = %e, "Stale token refresh failed"),
                _ => warn!(cycle, error = %e, "Token refresh failed, ending session"),
            }
            Err(e.to_string())
        }
    }
}

fn lock(state: &Mutex<RefreshState>) -> MutexGuard<'_, RefreshState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
