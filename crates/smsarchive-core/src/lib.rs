//! Client library for the SMS archive backend.
//!
//! The interesting part is the authenticated request pipeline: every call
//! carries the current access token, and when the server answers 401 the
//! token is refreshed once, no matter how many requests failed together,
//! before each failed request is resent exactly once.
//!
//! Start from [`ArchiveContext`], which wires the pieces together:
//!
//! ```no_run
//! use std::sync::Arc;
//! use smsarchive_core::{ArchiveContext, Config, MemoryStore};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let ctx = ArchiveContext::new(&Config::default(), Arc::new(MemoryStore::new()))?;
//! ctx.session.login("alice", "correct horse").await?;
//! let progress = ctx.api.import_progress("5f1c3a9e-2b7d-4c11-9e0a-6d2f8b3c4e5a").await?;
//! println!("{}", progress.summary());
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod models;

pub use api::{ApiClient, ApiError, AuthApi, RequestPipeline};
pub use auth::{
    AuthSession, AuthStatus, CredentialPair, CredentialStore, FileStore, KeyValueStore,
    KeyringStore, MemoryStore, RefreshCoordinator, StorageError,
};
pub use config::{Config, StorageBackend};
pub use context::ArchiveContext;
pub use models::{ImportProgress, ImportStatus, UserProfile};
