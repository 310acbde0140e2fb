use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{ApiError, Result};
use crate::query::{CacheKey, QueryClient, QueryObserver, RetryPolicy};
use crate::session::AuthState;

use super::task_client::TaskClient;
use super::task_dto::TaskFormData;
use super::task_models::{Task, TaskFilters};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskQueryKey {
    /// Task list under normalized filters; empty filters mean the full list.
    List(TaskFilters),
    Detail(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFamily {
    Tasks,
}

impl CacheKey for TaskQueryKey {
    type Family = QueryFamily;

    fn family(&self) -> QueryFamily {
        match self {
            TaskQueryKey::List(_) | TaskQueryKey::Detail(_) => QueryFamily::Tasks,
        }
    }
}

/// Cached reads and invalidating writes over [`TaskClient`].
#[derive(Clone)]
pub struct TaskQueries {
    client: TaskClient,
    cache: QueryClient<TaskQueryKey>,
}

impl TaskQueries {
    pub fn new(client: TaskClient, retry: RetryPolicy) -> Self {
        Self {
            client,
            cache: QueryClient::new(retry),
        }
    }

    pub fn client(&self) -> &TaskClient {
        &self.client
    }

    pub fn cache(&self) -> &QueryClient<TaskQueryKey> {
        &self.cache
    }

    /// The full list when `filters` is empty, a search otherwise.
    pub async fn tasks(&self, filters: &TaskFilters) -> Result<Arc<Vec<Task>>> {
        let filters = filters.normalized();
        let producer = self.list_producer(filters.clone());
        self.cache.fetch(TaskQueryKey::List(filters), producer).await
    }

    /// Refreshes one list explicitly; observers keep the old list meanwhile.
    pub async fn refresh_tasks(&self, filters: &TaskFilters) -> Result<Arc<Vec<Task>>> {
        let filters = filters.normalized();
        let producer = self.list_producer(filters.clone());
        self.cache.refetch(TaskQueryKey::List(filters), producer).await
    }

    pub fn watch_tasks(&self, filters: &TaskFilters) -> QueryObserver<Vec<Task>> {
        self.cache.subscribe(TaskQueryKey::List(filters.normalized()))
    }

    pub async fn task(&self, id: i64) -> Result<Arc<Task>> {
        let client = self.client.clone();
        self.cache
            .fetch(TaskQueryKey::Detail(id), move || {
                let client = client.clone();
                async move { client.get_by_id(id).await }
            })
            .await
    }

    pub fn watch_task(&self, id: i64) -> QueryObserver<Task> {
        self.cache.subscribe(TaskQueryKey::Detail(id))
    }

    pub async fn create(&self, form: TaskFormData) -> Result<Task> {
        let client = self.client.clone();
        let task = self
            .cache
            .mutate(&[QueryFamily::Tasks], async move { client.create(&form).await })
            .await?;
        tracing::info!("Created task {} '{}'", task.id, task.title);
        Ok(task)
    }

    pub async fn update(&self, id: i64, form: TaskFormData) -> Result<Task> {
        let client = self.client.clone();
        let task = self
            .cache
            .mutate(&[QueryFamily::Tasks], async move { client.update(id, &form).await })
            .await?;
        tracing::info!("Updated task {}", task.id);
        Ok(task)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        let client = self.client.clone();
        self.cache
            .mutate(&[QueryFamily::Tasks], async move { client.delete(id).await })
            .await?;
        tracing::info!("Deleted task {}", id);
        Ok(())
    }

    /// Export never touches the cache.
    pub async fn export(&self, filters: &TaskFilters) -> Result<Vec<u8>> {
        let client = self.client.clone();
        let filters = filters.normalized();
        self.cache
            .mutate(&[], async move { client.export_spreadsheet(&filters).await })
            .await
    }

    /// Writes the export to `dir/tasks_<YYYY-MM-DD>.xlsx` and returns the path.
    pub async fn export_to_dir(&self, filters: &TaskFilters, dir: &Path) -> Result<PathBuf> {
        let bytes = self.export(filters).await?;
        let path = dir.join(export_file_name());

        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ApiError::Internal(format!("could not write {}: {}", path.display(), e)))?;

        tracing::info!("Exported {} bytes to {}", bytes.len(), path.display());
        Ok(path)
    }

    /// Drops every cached task once the session ends, so the next user starts clean.
    pub fn reset_on_sign_out(&self, mut session: watch::Receiver<AuthState>) -> JoinHandle<()> {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            while session.changed().await.is_ok() {
                let signed_out = session.borrow_and_update().is_anonymous();
                if signed_out && !cache.is_empty() {
                    cache.clear();
                }
            }
        })
    }

    fn list_producer(
        &self,
        filters: TaskFilters,
    ) -> impl Fn() -> futures::future::BoxFuture<'static, Result<Vec<Task>>> + Send + Sync + 'static
    {
        use futures::FutureExt;

        let client = self.client.clone();
        move || {
            let client = client.clone();
            let filters = filters.clone();
            async move {
                if filters.is_empty() {
                    client.list().await
                } else {
                    client.search(&filters).await
                }
            }
            .boxed()
        }
    }
}

pub fn export_file_name() -> String {
    format!("tasks_{}.xlsx", Utc::now().format("%Y-%m-%d"))
}
