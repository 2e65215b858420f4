use std::collections::HashMap;
use std::future::Future;
use tokio::task::JoinHandle;

/// Long-running tasks keyed by name.
/// Spawning under a name that is already running aborts the old task first.
pub struct BackgroundTaskManager {
    tasks: HashMap<String, JoinHandle<()>>,
}

impl BackgroundTaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
        }
    }

    pub fn spawn<F>(&mut self, task_id: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task_id = task_id.into();
        if let Some(handle) = self.tasks.remove(&task_id) {
            tracing::debug!(task = %task_id, "Replacing background task");
            handle.abort();
        }

        let handle = tokio::spawn(future);
        self.tasks.insert(task_id, handle);
    }

    pub fn cancel(&mut self, task_id: &str) {
        if let Some(handle) = self.tasks.remove(task_id) {
            handle.abort();
        }
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.tasks
            .get(task_id)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancel all running tasks (used on shutdown)
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

impl Default for BackgroundTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BackgroundTaskManager {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
