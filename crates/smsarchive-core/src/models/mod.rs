//! Data models for the archive backend.
//!
//! - `UserProfile`: the logged-in account returned by `/api/auth/me`
//! - `ImportProgress`, `ImportStatus`: streaming import job polling

pub mod import;
pub mod user;

pub use import::{ImportProgress, ImportStatus};
pub use user::UserProfile;
