#![allow(dead_code)]

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use task_tracker::session::MemoryStorage;
use task_tracker::task::{Task, TaskPriority, TaskStatus};
use task_tracker::{AppState, Config};

pub const TOKEN: &str = "mock-jwt-token";
pub const EMAIL: &str = "test@example.com";
pub const PASSWORD: &str = "password123";

/// In-process stand-in for the remote task server.
pub struct MockApi {
    pub base_url: String,
    pub state: Arc<MockState>,
}

#[derive(Default)]
pub struct MockState {
    tasks: Mutex<Vec<Task>>,
    next_id: AtomicI64,
    pub list_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
    pub detail_calls: AtomicUsize,
    pub export_calls: AtomicUsize,
    pub create_calls: AtomicUsize,
    /// Delay applied to search responses, in milliseconds.
    pub search_delay_ms: AtomicU64,
    /// Number of upcoming list requests that answer 500.
    pub fail_next_lists: AtomicUsize,
    /// When set, every task request answers 401.
    pub revoked: AtomicBool,
    /// Task requests answered 401, counted when they arrive.
    pub rejected_calls: AtomicUsize,
    /// Delay applied before answering a task request with 401, in milliseconds.
    pub reject_delay_ms: AtomicU64,
}

impl MockState {
    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

fn timestamp(raw: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").unwrap()
}

fn seed_tasks() -> Vec<Task> {
    vec![
        Task {
            id: 1,
            title: "Test Task 1".into(),
            description: Some("Description 1".into()),
            status: TaskStatus::Todo,
            priority: TaskPriority::High,
            created_at: timestamp("2024-01-01T10:00:00"),
            updated_at: timestamp("2024-01-01T10:00:00"),
            due_date: None,
        },
        Task {
            id: 2,
            title: "Test Task 2".into(),
            description: Some("Description 2".into()),
            status: TaskStatus::InProgress,
            priority: TaskPriority::Medium,
            created_at: timestamp("2024-01-02T10:00:00"),
            updated_at: timestamp("2024-01-02T10:00:00"),
            due_date: None,
        },
    ]
}

impl MockApi {
    pub async fn start() -> Self {
        let state = Arc::new(MockState {
            tasks: Mutex::new(seed_tasks()),
            next_id: AtomicI64::new(3),
            ..Default::default()
        });

        let app = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/register", post(register))
            .route("/api/tasks", get(list_tasks).post(create_task))
            .route("/api/tasks/search", get(search_tasks))
            .route("/api/tasks/export", get(export_tasks))
            .route(
                "/api/tasks/:id",
                get(get_task).put(update_task).delete(delete_task),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}/api", addr),
            state,
        }
    }

    pub fn config(&self) -> Config {
        Config {
            api_base_url: self.base_url.clone(),
            session_file: std::env::temp_dir().join("task-tracker-unused.json"),
            query_retries: 1,
            retry_delay: Duration::ZERO,
        }
    }

    /// App wired to this mock, with its in-memory storage for inspection.
    pub fn app(&self) -> (AppState, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let app = AppState::with_storage(self.config(), storage.clone()).unwrap();
        (app, storage)
    }

    pub async fn logged_in_app(&self) -> (AppState, Arc<MemoryStorage>) {
        let (app, storage) = self.app();
        app.session.login(EMAIL, PASSWORD).await.unwrap();
        (app, storage)
    }
}

/// Polls `condition` until it holds, failing the test after a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn authorized(state: &MockState, headers: &HeaderMap) -> bool {
    let expected = format!("Bearer {}", TOKEN);
    !state.revoked.load(Ordering::SeqCst)
        && headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .map_or(false, |h| h == expected)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Invalid credentials" }))).into_response()
}

async fn reject(state: &MockState) -> Response {
    state.rejected_calls.fetch_add(1, Ordering::SeqCst);
    let delay = state.reject_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    unauthorized()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Task not found" }))).into_response()
}

async fn login(Json(body): Json<Value>) -> Response {
    if body["email"] == EMAIL && body["password"] == PASSWORD {
        Json(json!({ "token": TOKEN, "email": EMAIL, "name": "Test User" })).into_response()
    } else {
        unauthorized()
    }
}

async fn register(Json(body): Json<Value>) -> Response {
    if body["email"] == EMAIL {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Email already exists" })),
        )
            .into_response();
    }
    (
        StatusCode::CREATED,
        Json(json!({ "token": TOKEN, "email": body["email"], "name": body["name"] })),
    )
        .into_response()
}

async fn list_tasks(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return reject(&state).await;
    }
    state.list_calls.fetch_add(1, Ordering::SeqCst);

    let failing = state
        .fail_next_lists
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "boom" }))).into_response();
    }

    let tasks = state.tasks.lock().unwrap().clone();
    Json(tasks).into_response()
}

fn matching(state: &MockState, params: &HashMap<String, String>) -> Vec<Task> {
    let search = params.get("search").map(|s| s.to_lowercase());
    let tasks = state.tasks.lock().unwrap();
    let found = tasks
        .iter()
        .filter(|t| match &search {
            Some(s) => {
                t.title.to_lowercase().contains(s)
                    || t
                        .description
                        .as_deref()
                        .map_or(false, |d| d.to_lowercase().contains(s))
            }
            None => true,
        })
        .filter(|t| params.get("status").map_or(true, |s| t.status.as_str() == s.as_str()))
        .filter(|t| params.get("priority").map_or(true, |p| t.priority.as_str() == p.as_str()))
        .cloned()
        .collect();
    found
}

async fn search_tasks(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return reject(&state).await;
    }
    state.search_calls.fetch_add(1, Ordering::SeqCst);

    let delay = state.search_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    Json(matching(&state, &params)).into_response()
}

async fn export_tasks(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&state, &headers) {
        return reject(&state).await;
    }
    state.export_calls.fetch_add(1, Ordering::SeqCst);
    let _ = matching(&state, &params);
    (
        [(
            header::CONTENT_TYPE,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        )],
        "xlsx content",
    )
        .into_response()
}

async fn get_task(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if !authorized(&state, &headers) {
        return reject(&state).await;
    }
    state.detail_calls.fetch_add(1, Ordering::SeqCst);
    let task = state.tasks.lock().unwrap().iter().find(|t| t.id == id).cloned();
    match task {
        Some(task) => Json(task).into_response(),
        None => not_found(),
    }
}

fn apply(task: &mut Task, body: &Value) {
    if let Some(title) = body["title"].as_str() {
        task.title = title.to_string();
    }
    task.description = body["description"].as_str().map(str::to_string);
    if let Some(status) = body["status"].as_str() {
        task.status = status.parse().unwrap();
    }
    if let Some(priority) = body["priority"].as_str() {
        task.priority = priority.parse().unwrap();
    }
    task.due_date = body["dueDate"]
        .as_str()
        .map(|raw| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").unwrap());
    task.updated_at = Utc::now().naive_utc();
}

async fn create_task(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return reject(&state).await;
    }
    state.create_calls.fetch_add(1, Ordering::SeqCst);

    let now = Utc::now().naive_utc();
    let mut task = Task {
        id: state.next_id.fetch_add(1, Ordering::SeqCst),
        title: String::new(),
        description: None,
        status: TaskStatus::Todo,
        priority: TaskPriority::Medium,
        created_at: now,
        updated_at: now,
        due_date: None,
    };
    apply(&mut task, &body);
    state.tasks.lock().unwrap().push(task.clone());
    (StatusCode::CREATED, Json(task)).into_response()
}

async fn update_task(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return reject(&state).await;
    }
    let updated = {
        let mut tasks = state.tasks.lock().unwrap();
        tasks.iter_mut().find(|t| t.id == id).map(|task| {
            apply(task, &body);
            task.clone()
        })
    };
    match updated {
        Some(task) => Json(task).into_response(),
        None => not_found(),
    }
}

async fn delete_task(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Response {
    if !authorized(&state, &headers) {
        return reject(&state).await;
    }
    let removed = {
        let mut tasks = state.tasks.lock().unwrap();
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        tasks.len() < before
    };
    if !removed {
        return not_found();
    }
    StatusCode::NO_CONTENT.into_response()
}
