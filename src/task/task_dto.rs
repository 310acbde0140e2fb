use chrono::NaiveDateTime;
use serde::Serialize;
use validator::Validate;

use super::task_models::{timestamp, Task, TaskPriority, TaskStatus};

/// Body of create and update requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TaskFormData {
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    #[serde(with = "timestamp::option", skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDateTime>,
}

impl TaskFormData {
    /// A new TODO task with MEDIUM priority, matching the empty form defaults.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into().trim().to_string(),
            description: None,
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            due_date: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        let description = description.into();
        self.description = if description.trim().is_empty() {
            None
        } else {
            Some(description)
        };
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn due_date(mut self, due_date: Option<NaiveDateTime>) -> Self {
        self.due_date = due_date;
        self
    }
}

impl From<&Task> for TaskFormData {
    fn from(task: &Task) -> Self {
        Self {
            title: task.title.clone(),
            description: task.description.clone(),
            status: task.status,
            priority: task.priority,
            due_date: task.due_date,
        }
    }
}
