use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, watch};
use validator::Validate;

use crate::error::{ApiError, Result};
use crate::session::{AuthState, SessionEvent};

use super::task_dto::TaskFormData;
use super::task_models::{Task, TaskFilters};

/// Client for the `/tasks` endpoints.
///
/// Reads the bearer token from the session watch channel and reports
/// rejected tokens on `events` instead of touching the session itself.
///
/// A 401 returns [`ApiError::Unauthorized`] as soon as the event is sent; the
/// session manager applies the logout later, on its listener task. Callers that
/// need the anonymous state first await `SessionManager::signed_out`.
#[derive(Clone)]
pub struct TaskClient {
    http: reqwest::Client,
    base_url: String,
    session: watch::Receiver<AuthState>,
    events: broadcast::Sender<SessionEvent>,
}

impl TaskClient {
    /// `base_url` is the tasks root, e.g. `http://localhost:8080/api/tasks`.
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        session: watch::Receiver<AuthState>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            events,
        }
    }

    pub async fn list(&self) -> Result<Vec<Task>> {
        let request = self.http.get(&self.base_url);
        self.send_json(request).await
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Task> {
        let request = self.http.get(format!("{}/{}", self.base_url, id));
        self.send_json(request).await
    }

    pub async fn search(&self, filters: &TaskFilters) -> Result<Vec<Task>> {
        let request = self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&filters.query_pairs());
        self.send_json(request).await
    }

    pub async fn create(&self, form: &TaskFormData) -> Result<Task> {
        form.validate()?;
        let request = self.http.post(&self.base_url).json(form);
        self.send_json(request).await
    }

    pub async fn update(&self, id: i64, form: &TaskFormData) -> Result<Task> {
        form.validate()?;
        let request = self.http.put(format!("{}/{}", self.base_url, id)).json(form);
        self.send_json(request).await
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let request = self.http.delete(format!("{}/{}", self.base_url, id));
        self.send(request).await?;
        Ok(())
    }

    /// Spreadsheet of the tasks matching `filters`, as raw bytes.
    pub async fn export_spreadsheet(&self, filters: &TaskFilters) -> Result<Vec<u8>> {
        let request = self
            .http
            .get(format!("{}/export", self.base_url))
            .query(&filters.query_pairs());
        let response = self.send(request).await?;
        let bytes = response.bytes().await?;
        Ok(bytes.to_vec())
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = self.send(request).await?;
        Ok(response.json().await?)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let token = self.session.borrow().token().map(str::to_string);
        let request = match &token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        tracing::debug!("{} -> {}", response.url(), status);

        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED {
            // No receiver just means nobody is tracking the session.
            let _ = self.events.send(SessionEvent::Unauthorized { token });
            return Err(ApiError::Unauthorized);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status, &body))
    }
}
