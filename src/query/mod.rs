pub mod query_client;
pub mod query_state;

pub use query_client::{CacheKey, QueryClient, RetryPolicy};
pub use query_state::{QueryObserver, QueryState, QueryStatus};
