//! Task manager — the tool-facing surface used by chat and HTTP handlers.
//!
//! Store edits go through here so the scheduler sees them immediately.

use std::sync::Arc;

use async_trait::async_trait;

use steward_core::error::Result;

use crate::store::TaskStore;
use crate::tasks::{NewTask, Task, TaskRun, TaskUpdate};

/// Scheduler operations the manager needs after touching storage.
#[async_trait]
pub trait TaskReloader: Send + Sync {
    /// Re-arm (or disarm) a task's timer after it changed.
    async fn reload(&self, task_id: &str) -> Result<()>;
    /// Drop a task's timer.
    fn remove(&self, task_id: &str);
    /// Execute a task immediately.
    async fn run_now(&self, task_id: &str) -> Result<String>;
}

pub struct TaskManager {
    store: TaskStore,
    scheduler: Arc<dyn TaskReloader>,
}

impl TaskManager {
    pub fn new(store: TaskStore, scheduler: Arc<dyn TaskReloader>) -> Self {
        Self { store, scheduler }
    }

    pub async fn create(&self, new: NewTask) -> Result<Task> {
        let task = self.store.create(new)?;
        self.scheduler.reload(&task.id).await?;
        Ok(task)
    }

    pub async fn update(&self, id: &str, update: TaskUpdate) -> Result<Task> {
        let task = self.store.update(id, update)?;
        self.scheduler.reload(id).await?;
        Ok(task)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Task> {
        self.update(id, TaskUpdate::enabled(enabled)).await
    }

    pub async fn enable(&self, id: &str) -> Result<Task> {
        self.set_enabled(id, true).await
    }

    pub async fn disable(&self, id: &str) -> Result<Task> {
        self.set_enabled(id, false).await
    }

    /// Disarm first so a deleted task can never fire.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.scheduler.remove(id);
        self.store.delete(id)
    }

    pub async fn run_now(&self, id: &str) -> Result<String> {
        self.scheduler.run_now(id).await
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        self.store.get(id)
    }

    pub fn list(&self) -> Result<Vec<Task>> {
        self.store.list()
    }

    pub fn runs(&self, id: &str, limit: usize) -> Result<Vec<TaskRun>> {
        self.store.list_runs(id, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Scheduler;
    use crate::tasks::RunStatus;
    use steward_core::PromptExecutor;
    use steward_core::config::SchedulerConfig;
    use steward_core::error::StewardError;
    use steward_store::Database;
    use std::sync::Mutex;

    struct StaticExecutor;

    #[async_trait]
    impl PromptExecutor for StaticExecutor {
        async fn execute(&self, _prompt: &str) -> Result<String> {
            Ok("ok".into())
        }
    }

    /// Records which reload calls the manager makes.
    #[derive(Default)]
    struct RecordingReloader {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskReloader for RecordingReloader {
        async fn reload(&self, task_id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("reload:{task_id}"));
            Ok(())
        }

        fn remove(&self, task_id: &str) {
            self.calls.lock().unwrap().push(format!("remove:{task_id}"));
        }

        async fn run_now(&self, task_id: &str) -> Result<String> {
            self.calls.lock().unwrap().push(format!("run:{task_id}"));
            Ok("ran".into())
        }
    }

    fn wired() -> (TaskManager, Scheduler, TaskStore) {
        let store = TaskStore::new(Database::open_in_memory().unwrap());
        let scheduler =
            Scheduler::new(store.clone(), Arc::new(StaticExecutor), SchedulerConfig::default());
        let manager = TaskManager::new(store.clone(), Arc::new(scheduler.clone()));
        (manager, scheduler, store)
    }

    #[tokio::test]
    async fn test_edits_notify_the_scheduler() {
        let store = TaskStore::new(Database::open_in_memory().unwrap());
        let reloader = Arc::new(RecordingReloader::default());
        let manager = TaskManager::new(store, reloader.clone());

        manager.create(NewTask::new("t1", "a", "0 8 * * *", "p")).await.unwrap();
        manager.disable("t1").await.unwrap();
        assert_eq!(manager.run_now("t1").await.unwrap(), "ran");
        manager.delete("t1").await.unwrap();

        let calls = reloader.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["reload:t1", "reload:t1", "run:t1", "remove:t1"]);
    }

    #[tokio::test]
    async fn test_failed_create_does_not_reload() {
        let store = TaskStore::new(Database::open_in_memory().unwrap());
        let reloader = Arc::new(RecordingReloader::default());
        let manager = TaskManager::new(store, reloader.clone());

        let err = manager.create(NewTask::new("t1", "a", "bogus", "p")).await.unwrap_err();
        assert!(matches!(err, StewardError::Validation(_)));
        assert!(reloader.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disable_disarms_running_scheduler() {
        let (manager, scheduler, store) = wired();
        scheduler.start().await.unwrap();

        manager.create(NewTask::new("t1", "a", "* * * * *", "p")).await.unwrap();
        assert_eq!(scheduler.armed_tasks(), vec!["t1"]);

        manager.disable("t1").await.unwrap();
        assert!(scheduler.armed_tasks().is_empty());
        let tomorrow = chrono::Utc::now() + chrono::Duration::days(1);
        assert!(store.get_due_tasks(tomorrow).unwrap().is_empty());

        manager.enable("t1").await.unwrap();
        assert_eq!(scheduler.armed_tasks(), vec!["t1"]);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_delete_removes_runs_and_timer() {
        let (manager, scheduler, _store) = wired();
        scheduler.start().await.unwrap();
        manager.create(NewTask::new("t1", "a", "* * * * *", "p")).await.unwrap();
        manager.run_now("t1").await.unwrap();
        manager.run_now("t1").await.unwrap();
        let runs = manager.runs("t1", 10).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatus::Success));

        manager.delete("t1").await.unwrap();
        assert!(manager.runs("t1", 10).unwrap().is_empty());
        assert!(manager.get("t1").unwrap().is_none());
        assert!(scheduler.armed_tasks().is_empty());

        let err = manager.delete("t1").await.unwrap_err();
        assert!(matches!(err, StewardError::NotFound { .. }));
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_update_rearms_with_new_schedule() {
        let (manager, scheduler, _store) = wired();
        scheduler.start().await.unwrap();
        manager.create(NewTask::new("t1", "a", "0 8 * * *", "p")).await.unwrap();

        let task = manager
            .update(
                "t1",
                TaskUpdate { cron_expression: Some("*/5 * * * *".into()), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(task.cron_expression, "*/5 * * * *");
        assert!(task.next_run_at.unwrap() - chrono::Utc::now() <= chrono::Duration::minutes(5));
        assert_eq!(scheduler.armed_tasks(), vec!["t1"]);
        assert_eq!(manager.list().unwrap().len(), 1);
        scheduler.stop();
    }
}
