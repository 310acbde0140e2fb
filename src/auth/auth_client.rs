use reqwest::StatusCode;
use validator::Validate;

use crate::error::{error_message, AuthError};

use super::auth_dto::{AuthResponse, LoginRequest, RegisterRequest};

/// Client for the `/auth` endpoints.
#[derive(Clone)]
pub struct AuthClient {
    http: reqwest::Client,
    base_url: String,
}

impl AuthClient {
    /// `base_url` is the auth root, e.g. `http://localhost:8080/api/auth`.
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn login(&self, payload: &LoginRequest) -> Result<AuthResponse, AuthError> {
        payload.validate()?;

        tracing::debug!("POST {}/login", self.base_url);
        let response = self
            .http
            .post(format!("{}/login", self.base_url))
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED => AuthError::InvalidCredentials,
            _ => unknown(status, &body),
        })
    }

    pub async fn register(&self, payload: &RegisterRequest) -> Result<AuthResponse, AuthError> {
        payload.validate()?;

        tracing::debug!("POST {}/register", self.base_url);
        let response = self
            .http
            .post(format!("{}/register", self.base_url))
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT => AuthError::EmailExists,
            _ => unknown(status, &body),
        })
    }
}

fn unknown(status: StatusCode, body: &str) -> AuthError {
    let message = error_message(body).unwrap_or_else(|| format!("server responded with {}", status));
    AuthError::Unknown(message)
}
