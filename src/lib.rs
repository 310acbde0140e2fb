//! Client for a remote task tracker: session handling, cached task queries and export.

pub mod auth;
pub mod error;
pub mod query;
pub mod session;
pub mod state;
pub mod task;

pub use error::{ApiError, AuthError, StorageError};
pub use state::{AppState, Config};
