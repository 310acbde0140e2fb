pub mod task_client;
pub mod task_dto;
pub mod task_models;
pub mod task_queries;

pub use task_client::TaskClient;
pub use task_dto::TaskFormData;
pub use task_models::{parse_filter, Task, TaskFilters, TaskPriority, TaskStatus};
pub use task_queries::{QueryFamily, TaskQueries, TaskQueryKey};
