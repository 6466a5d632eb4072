//! Authentication module for managing the session and its credentials.
//!
//! This module provides:
//! - `CredentialStore`: the access/refresh pair, auth status and profile
//! - `KeyValueStore` backends: session file, OS keychain, memory
//! - `RefreshCoordinator`: collapses concurrent refreshes into one call
//! - `AuthSession`: login, registration, logout and startup hydration

pub mod credentials;
pub mod refresh;
pub mod session;
pub mod storage;

pub use credentials::{AuthStatus, CredentialPair, CredentialStore};
pub use refresh::RefreshCoordinator;
pub use session::AuthSession;
pub use storage::{FileStore, KeyValueStore, KeyringStore, MemoryStore, StorageError};
