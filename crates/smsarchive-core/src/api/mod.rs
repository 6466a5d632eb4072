//! REST API access for the archive backend.
//!
//! This module provides:
//! - `AuthApi`: login, registration and refresh calls (no bearer attached)
//! - `RequestPipeline`: attaches the access token and recovers from 401
//! - `ApiClient`: typed authenticated calls over the pipeline
//!
//! The backend answers 401 only for a missing or expired access token and
//! uses 403 for ownership failures; the pipeline relies on that split.

pub mod auth;
pub mod client;
pub mod error;
pub mod pipeline;

pub use auth::AuthApi;
pub use client::{ApiClient, DEFAULT_IMPORT_POLL_INTERVAL};
pub use error::ApiError;
pub use pipeline::RequestPipeline;
