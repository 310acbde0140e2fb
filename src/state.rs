use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::auth::AuthClient;
use crate::query::RetryPolicy;
use crate::session::{FileStorage, KeyValueStorage, SessionManager, SessionStore};
use crate::task::{TaskClient, TaskQueries};

pub const DEFAULT_API_URL: &str = "http://localhost:8080/api";

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub session_file: PathBuf,
    pub query_retries: u32,
    pub retry_delay: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_base_url = std::env::var("TASK_TRACKER_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string());

        let session_file = match std::env::var("TASK_TRACKER_SESSION_FILE") {
            Ok(path) => PathBuf::from(path),
            Err(_) => default_session_file(),
        };

        let query_retries = std::env::var("TASK_TRACKER_QUERY_RETRIES")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .context("TASK_TRACKER_QUERY_RETRIES must be a number")?;

        let retry_delay_ms: u64 = std::env::var("TASK_TRACKER_RETRY_DELAY_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .context("TASK_TRACKER_RETRY_DELAY_MS must be a number")?;

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            session_file,
            query_retries,
            retry_delay: Duration::from_millis(retry_delay_ms),
        })
    }

    pub fn auth_url(&self) -> String {
        format!("{}/auth", self.api_base_url)
    }

    pub fn tasks_url(&self) -> String {
        format!("{}/tasks", self.api_base_url)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.query_retries,
            delay: self.retry_delay,
        }
    }
}

/// `~/.task-tracker/session.json`, or the working directory when there is no home.
pub fn default_session_file() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".task-tracker");
    path.push("session.json");
    path
}

/// Everything the front end talks to, wired together.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub session: SessionManager,
    pub tasks: TaskQueries,
}

impl AppState {
    /// Wires the session to the file-backed store named in `config`.
    /// Must be called inside a Tokio runtime.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let storage = Arc::new(FileStorage::open(&config.session_file));
        Self::with_storage(config, storage)
    }

    pub fn with_storage(config: Config, storage: Arc<dyn KeyValueStorage>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        // Create session manager and rehydrate before anything reads the token
        let auth_client = AuthClient::new(http.clone(), config.auth_url());
        let session = SessionManager::new(SessionStore::new(storage), auth_client);
        session.restore();

        // Task client reports rejected tokens; the session manager acts on them
        let (events_tx, events_rx) = broadcast::channel(16);
        session.listen(events_rx);

        let task_client = TaskClient::new(http, config.tasks_url(), session.subscribe(), events_tx);
        let tasks = TaskQueries::new(task_client, config.retry_policy());
        tasks.reset_on_sign_out(session.subscribe());

        Ok(Self {
            config: Arc::new(config),
            session,
            tasks,
        })
    }
}
