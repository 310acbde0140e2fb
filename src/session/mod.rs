pub mod session_manager;
pub mod session_models;
pub mod session_store;

pub use session_manager::SessionManager;
pub use session_models::{AuthState, Session, SessionEvent, User};
pub use session_store::{FileStorage, KeyValueStorage, MemoryStorage, SessionStore};
