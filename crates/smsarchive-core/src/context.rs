//! Wiring of the credential store, refresh coordinator, pipeline and API
//! client. Every component gets its collaborators passed in here; nothing
//! is looked up globally.

use std::sync::Arc;

use anyhow::Result;
use reqwest::Client;
use tracing::debug;

use crate::api::{ApiClient, ApiError, AuthApi, RequestPipeline};
use crate::auth::{
    AuthSession, CredentialStore, FileStore, KeyValueStore, KeyringStore, RefreshCoordinator,
};
use crate::config::{Config, StorageBackend};

pub struct ArchiveContext {
    pub credentials: Arc<CredentialStore>,
    pub refresher: Arc<RefreshCoordinator>,
    pub session: AuthSession,
    pub api: ApiClient,
}

impl ArchiveContext {
    /// Build every component on top of the given storage backend
    pub fn new(config: &Config, storage: Arc<dyn KeyValueStore>) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self::with_client(client, &config.api_base_url, storage))
    }

    /// Build on a preconfigured HTTP client
    pub fn with_client(client: Client, base_url: &str, storage: Arc<dyn KeyValueStore>) -> Self {
        let auth_api = AuthApi::new(client.clone(), base_url);
        let credentials = Arc::new(CredentialStore::new(storage));
        let refresher = Arc::new(RefreshCoordinator::new(
            Arc::clone(&credentials),
            auth_api.clone(),
        ));
        let pipeline = RequestPipeline::new(client, Arc::clone(&credentials), Arc::clone(&refresher));
        let api = ApiClient::new(pipeline, base_url);
        let session = AuthSession::new(
            auth_api,
            api.clone(),
            Arc::clone(&credentials),
            Arc::clone(&refresher),
        );

        Self {
            credentials,
            refresher,
            session,
            api,
        }
    }

    /// Build with the storage backend named in the config
    pub fn from_config(config: &Config) -> Result<Self> {
        let storage: Arc<dyn KeyValueStore> = match config.storage {
            StorageBackend::File => {
                let store = FileStore::in_dir(&config.cache_dir()?);
                debug!(path = ?store.path(), "Using session file");
                Arc::new(store)
            }
            StorageBackend::Keyring => {
                debug!("Using OS keychain for credentials");
                Arc::new(KeyringStore::new())
            }
        };
        Ok(Self::new(config, storage)?)
    }
}
