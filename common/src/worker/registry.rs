// Callable registry
// Maps the callable names stored in job state to async functions

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Everything a callable receives for one fire attempt
#[derive(Debug, Clone)]
pub struct JobInvocation {
    pub job_id: String,
    pub job_name: String,
    pub instance_id: String,
    pub scheduled_run_time: DateTime<Utc>,
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

/// Job logic registered under a name
pub type JobCallable = Arc<
    dyn Fn(JobInvocation) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync,
>;

/// JobRegistry resolves callable names at execution time.
///
/// Built once before the scheduler starts and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct JobRegistry {
    callables: HashMap<String, JobCallable>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callable` under `name`, replacing any previous registration
    pub fn register<F, Fut>(mut self, name: impl Into<String>, callable: F) -> Self
    where
        F: Fn(JobInvocation) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), anyhow::Error>> + Send + 'static,
    {
        let callable: JobCallable = Arc::new(move |invocation| Box::pin(callable(invocation)));
        self.callables.insert(name.into(), callable);
        self
    }

    pub fn get(&self, name: &str) -> Option<JobCallable> {
        self.callables.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callables.contains_key(name)
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("callables", &self.callables.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation() -> JobInvocation {
        JobInvocation {
            job_id: "id".to_string(),
            job_name: "name".to_string(),
            instance_id: "i-1".to_string(),
            scheduled_run_time: Utc::now(),
            args: vec![serde_json::json!(2), serde_json::json!(3)],
            kwargs: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_registered_callable_receives_args() {
        let registry = JobRegistry::new().register("sum", |inv: JobInvocation| async move {
            let total: i64 = inv.args.iter().filter_map(|v| v.as_i64()).sum();
            anyhow::ensure!(total == 5, "unexpected total {total}");
            Ok(())
        });

        let callable = registry.get("sum").unwrap();
        assert!(callable(invocation()).await.is_ok());
    }

    #[test]
    fn test_unknown_callable() {
        let registry = JobRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(!registry.contains("missing"));
    }
}
