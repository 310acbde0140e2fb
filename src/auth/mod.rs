pub mod auth_client;
pub mod auth_dto;

pub use auth_client::AuthClient;
pub use auth_dto::{AuthResponse, LoginRequest, RegisterRequest};
