//! SQLite-backed task store — task definitions plus append-only run history.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};

use steward_core::error::{Result, StewardError};
use steward_store::Database;
use steward_store::db::{decode_time, encode_time};

use crate::cron::CronSchedule;
use crate::tasks::{NewTask, RunStatus, Task, TaskRun, TaskUpdate};

const TASK_COLUMNS: &str = "id, name, cron_expression, prompt, delivery_config, enabled, \
                            last_run_at, next_run_at, created_at, updated_at";
const RUN_COLUMNS: &str = "id, task_id, status, result, started_at, finished_at";

/// Message recorded on runs that were still `running` when the process died.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: process stopped before completion";

/// Task persistence on top of the shared storage engine.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ─── Tasks ──────────────────────────────────────

    /// Create an enabled task. The cron expression is validated before anything is written.
    pub fn create(&self, new: NewTask) -> Result<Task> {
        let now = Utc::now();
        let schedule = CronSchedule::validate(&new.cron_expression, now)?;
        let task = Task {
            id: new.id,
            name: new.name,
            cron_expression: schedule.expression().to_string(),
            prompt: new.prompt,
            delivery: new.delivery,
            enabled: true,
            last_run_at: None,
            next_run_at: new.next_run_at.or_else(|| schedule.next_after(now)),
            created_at: now,
            updated_at: now,
        };

        self.db.with_tx(|tx| {
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM scheduled_tasks WHERE id = ?1)",
                    [&task.id],
                    |r| r.get(0),
                )
                .map_err(StewardError::storage)?;
            if exists {
                return Err(StewardError::validation(format!(
                    "task '{}' already exists",
                    task.id
                )));
            }
            write_task(tx, &task, true)
        })?;

        tracing::info!(
            "📅 Task created: '{}' ({}) cron='{}'",
            task.name,
            task.id,
            task.cron_expression
        );
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Option<Task>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                [id],
                task_from_row,
            )
            .optional()
        })
    }

    /// All tasks, newest first.
    pub fn list(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at DESC, id"),
            [],
        )
    }

    /// Enabled tasks only — what the scheduler arms on start.
    pub fn list_enabled(&self) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE enabled = 1 ORDER BY created_at DESC, id"
            ),
            [],
        )
    }

    /// Enabled tasks whose next fire is at or before `now`.
    /// Polling path for recovering fires lost while no timers were armed.
    pub fn get_due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE enabled = 1 AND next_run_at IS NOT NULL AND next_run_at <= ?1
                 ORDER BY next_run_at, id"
            ),
            [encode_time(now)],
        )
    }

    /// Apply a partial update. Omitted fields are untouched; an empty update is a no-op.
    pub fn update(&self, id: &str, update: TaskUpdate) -> Result<Task> {
        let now = Utc::now();
        // Validate before touching storage.
        let schedule = update
            .cron_expression
            .as_deref()
            .map(|expr| CronSchedule::validate(expr, now))
            .transpose()?;

        if update.is_empty() {
            return self.get(id)?.ok_or_else(|| StewardError::not_found("task", id));
        }

        let task = self.db.with_tx(|tx| {
            let mut task = tx
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                    [id],
                    task_from_row,
                )
                .optional()
                .map_err(StewardError::storage)?
                .ok_or_else(|| StewardError::not_found("task", id))?;

            let was_enabled = task.enabled;
            if let Some(name) = update.name {
                task.name = name;
            }
            if let Some(prompt) = update.prompt {
                task.prompt = prompt;
            }
            if let Some(delivery) = update.delivery {
                task.delivery = delivery;
            }
            if let Some(enabled) = update.enabled {
                task.enabled = enabled;
            }
            if let Some(schedule) = &schedule {
                task.cron_expression = schedule.expression().to_string();
                task.next_run_at = schedule.next_after(now);
            } else if task.enabled && !was_enabled {
                // Re-enabled: skip the fires missed while disabled.
                task.next_run_at = task.schedule()?.next_after(now);
            }
            task.updated_at = now;

            write_task(tx, &task, false)?;
            Ok(task)
        })?;

        tracing::info!("✏️ Task updated: '{}' ({})", task.name, task.id);
        Ok(task)
    }

    /// Delete a task and, by cascade, its run history.
    pub fn delete(&self, id: &str) -> Result<()> {
        let deleted = self
            .db
            .with_conn(|conn| conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", [id]))?;
        if deleted == 0 {
            return Err(StewardError::not_found("task", id));
        }
        tracing::info!("🗑️ Task deleted: {id}");
        Ok(())
    }

    /// Persist post-execution bookkeeping.
    pub fn record_fire(
        &self,
        id: &str,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET last_run_at = ?1, next_run_at = ?2 WHERE id = ?3",
                params![encode_time(last_run_at), next_run_at.map(encode_time), id],
            )
        })?;
        Ok(())
    }

    /// Overwrite the stored next fire time.
    pub fn set_next_run_at(&self, id: &str, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET next_run_at = ?1 WHERE id = ?2",
                params![next_run_at.map(encode_time), id],
            )
        })?;
        Ok(())
    }

    /// (total, enabled) task counts.
    pub fn counts(&self) -> Result<(usize, usize)> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(enabled), 0) FROM scheduled_tasks",
                [],
                |r| Ok((r.get::<_, i64>(0)? as usize, r.get::<_, i64>(1)? as usize)),
            )
        })
    }

    fn query_tasks(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Task>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, task_from_row)?;
            rows.collect()
        })
    }

    // ─── Runs ──────────────────────────────────────

    /// Record the start of an execution.
    pub fn create_run(&self, id: &str, task_id: &str) -> Result<TaskRun> {
        let run = TaskRun {
            id: id.to_string(),
            task_id: task_id.to_string(),
            status: RunStatus::Running,
            result: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.db.with_tx(|tx| {
            let exists: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM scheduled_tasks WHERE id = ?1)",
                    [task_id],
                    |r| r.get(0),
                )
                .map_err(StewardError::storage)?;
            if !exists {
                return Err(StewardError::not_found("task", task_id));
            }
            tx.execute(
                "INSERT INTO task_runs (id, task_id, status, started_at) VALUES (?1, ?2, ?3, ?4)",
                params![run.id, run.task_id, run.status.as_str(), encode_time(run.started_at)],
            )
            .map_err(StewardError::storage)?;
            Ok(())
        })?;
        Ok(run)
    }

    /// Finalize a run with a terminal status.
    pub fn complete_run(&self, id: &str, status: RunStatus, result: Option<&str>) -> Result<()> {
        if !status.is_finished() {
            return Err(StewardError::validation("a run can only be completed as success or error"));
        }
        let updated = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE task_runs SET status = ?1, result = ?2, finished_at = ?3 WHERE id = ?4",
                params![status.as_str(), result, encode_time(Utc::now()), id],
            )
        })?;
        if updated == 0 {
            return Err(StewardError::not_found("run", id));
        }
        Ok(())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<TaskRun>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {RUN_COLUMNS} FROM task_runs WHERE id = ?1"),
                [id],
                run_from_row,
            )
            .optional()
        })
    }

    /// Most recent runs first, at most `limit`.
    pub fn list_runs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRun>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM task_runs WHERE task_id = ?1
                 ORDER BY started_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(
                params![task_id, i64::try_from(limit).unwrap_or(i64::MAX)],
                run_from_row,
            )?;
            rows.collect()
        })
    }

    /// Mark runs left in `running` by a previous process as failed.
    pub fn fail_interrupted_runs(&self) -> Result<usize> {
        let count = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE task_runs SET status = 'error', result = ?1, finished_at = ?2
                 WHERE status = 'running'",
                params![INTERRUPTED_MESSAGE, encode_time(Utc::now())],
            )
        })?;
        if count > 0 {
            tracing::warn!("⚠️ Marked {count} interrupted run(s) as failed");
        }
        Ok(count)
    }

    /// Keep only the newest `keep` runs of a task. Returns how many were removed.
    pub fn prune_runs(&self, task_id: &str, keep: usize) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM task_runs WHERE task_id = ?1 AND id NOT IN (
                     SELECT id FROM task_runs WHERE task_id = ?1
                     ORDER BY started_at DESC, rowid DESC LIMIT ?2
                 )",
                params![task_id, i64::try_from(keep).unwrap_or(i64::MAX)],
            )
        })
    }
}

fn write_task(tx: &rusqlite::Transaction<'_>, task: &Task, insert: bool) -> Result<()> {
    let sql = if insert {
        "INSERT INTO scheduled_tasks
         (id, name, cron_expression, prompt, delivery_config, enabled,
          last_run_at, next_run_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
    } else {
        "UPDATE scheduled_tasks SET name = ?2, cron_expression = ?3, prompt = ?4,
         delivery_config = ?5, enabled = ?6, last_run_at = ?7, next_run_at = ?8,
         created_at = ?9, updated_at = ?10
         WHERE id = ?1"
    };
    tx.execute(
        sql,
        params![
            task.id,
            task.name,
            task.cron_expression,
            task.prompt,
            task.delivery.as_ref().map(|d| d.to_string()),
            task.enabled,
            task.last_run_at.map(encode_time),
            task.next_run_at.map(encode_time),
            encode_time(task.created_at),
            encode_time(task.updated_at),
        ],
    )
    .map_err(StewardError::storage)?;
    Ok(())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let delivery: Option<String> = row.get(4)?;
    let last_run_at: Option<String> = row.get(6)?;
    let next_run_at: Option<String> = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let delivery = delivery
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        cron_expression: row.get(2)?,
        prompt: row.get(3)?,
        delivery,
        enabled: row.get(5)?,
        last_run_at: last_run_at.as_deref().and_then(decode_time),
        next_run_at: next_run_at.as_deref().and_then(decode_time),
        created_at: decode_time(&created_at).unwrap_or_default(),
        updated_at: decode_time(&updated_at).unwrap_or_default(),
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRun> {
    let status: String = row.get(2)?;
    let started_at: String = row.get(4)?;
    let finished_at: Option<String> = row.get(5)?;

    Ok(TaskRun {
        id: row.get(0)?,
        task_id: row.get(1)?,
        // The CHECK constraint keeps unknown values out of the table.
        status: status.parse().unwrap_or(RunStatus::Error),
        result: row.get(3)?,
        started_at: decode_time(&started_at).unwrap_or_default(),
        finished_at: finished_at.as_deref().and_then(decode_time),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Timelike};
    use serde_json::json;

    fn store() -> TaskStore {
        TaskStore::new(Database::open_in_memory().unwrap())
    }

    #[test]
    fn test_create_computes_next_run() {
        let store = store();
        let task = store
            .create(
                NewTask::new("digest", "Daily digest", "0 8 * * *", "Summarize my emails")
                    .with_delivery(json!({"type": "slack", "channel": "#digest"})),
            )
            .unwrap();
        assert!(task.enabled);
        let next = task.next_run_at.unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (8, 0, 0));
        assert!(next > task.created_at);
        assert!(next - task.created_at <= Duration::hours(24));

        let loaded = store.get("digest").unwrap().unwrap();
        assert_eq!(loaded.delivery, Some(json!({"type": "slack", "channel": "#digest"})));
        assert_eq!(loaded.next_run_at, task.next_run_at);
    }

    #[test]
    fn test_create_rejects_bad_cron_without_side_effects() {
        let store = store();
        let err = store.create(NewTask::new("t1", "bad", "61 * * * *", "p")).unwrap_err();
        assert!(matches!(err, StewardError::Validation(_)));
        assert!(store.get("t1").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_create_duplicate_id_rejected() {
        let store = store();
        store.create(NewTask::new("t1", "a", "* * * * *", "p")).unwrap();
        let err = store.create(NewTask::new("t1", "b", "* * * * *", "p")).unwrap_err();
        assert!(matches!(err, StewardError::Validation(_)));
        assert_eq!(store.get("t1").unwrap().unwrap().name, "a");
    }

    #[test]
    fn test_create_with_explicit_next_run() {
        let store = store();
        let at = Utc::now() - Duration::minutes(5);
        let task = store
            .create(NewTask::new("t1", "a", "* * * * *", "p").with_next_run_at(at))
            .unwrap();
        assert_eq!(task.next_run_at, Some(at));
        assert_eq!(store.get_due_tasks(Utc::now()).unwrap().len(), 1);
    }

    #[test]
    fn test_list_newest_first() {
        let store = store();
        store.create(NewTask::new("old", "old", "* * * * *", "p")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.create(NewTask::new("new", "new", "* * * * *", "p")).unwrap();
        let ids: Vec<String> = store.list().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["new", "old"]);
    }

    #[test]
    fn test_partial_update() {
        let store = store();
        let original = store
            .create(
                NewTask::new("t1", "name", "0 8 * * *", "prompt")
                    .with_delivery(json!({"type": "email"})),
            )
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let updated = store
            .update("t1", TaskUpdate { prompt: Some("new prompt".into()), ..Default::default() })
            .unwrap();
        assert_eq!(updated.prompt, "new prompt");
        assert_eq!(updated.name, "name");
        assert_eq!(updated.cron_expression, "0 8 * * *");
        assert_eq!(updated.delivery, original.delivery);
        assert_eq!(updated.next_run_at, original.next_run_at);
        assert!(updated.updated_at > original.updated_at);

        let cleared = store
            .update("t1", TaskUpdate { delivery: Some(None), ..Default::default() })
            .unwrap();
        assert_eq!(cleared.delivery, None);
    }

    #[test]
    fn test_empty_update_is_noop() {
        let store = store();
        let original = store.create(NewTask::new("t1", "a", "0 8 * * *", "p")).unwrap();
        let same = store.update("t1", TaskUpdate::default()).unwrap();
        assert_eq!(same, original);
    }

    #[test]
    fn test_update_cron_is_validated() {
        let store = store();
        let original = store.create(NewTask::new("t1", "a", "0 8 * * *", "p")).unwrap();
        let err = store
            .update(
                "t1",
                TaskUpdate {
                    name: Some("renamed".into()),
                    cron_expression: Some("nope".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, StewardError::Validation(_)));
        assert_eq!(store.get("t1").unwrap().unwrap(), original);

        let update = TaskUpdate {
            cron_expression: Some("30 9 * * *".into()),
            ..Default::default()
        };
        let updated = store.update("t1", update).unwrap();
        let next = updated.next_run_at.unwrap();
        assert_eq!((next.hour(), next.minute()), (9, 30));
    }

    #[test]
    fn test_update_missing_task() {
        let store = store();
        let err = store.update("ghost", TaskUpdate::enabled(false)).unwrap_err();
        assert!(matches!(err, StewardError::NotFound { .. }));
        let err = store.update("ghost", TaskUpdate::default()).unwrap_err();
        assert!(matches!(err, StewardError::NotFound { .. }));
    }

    #[test]
    fn test_disabled_task_never_due() {
        let store = store();
        let past = Utc::now() - Duration::minutes(10);
        store
            .create(NewTask::new("t1", "a", "* * * * *", "p").with_next_run_at(past))
            .unwrap();
        store.update("t1", TaskUpdate::enabled(false)).unwrap();
        assert!(store.get_due_tasks(Utc::now()).unwrap().is_empty());
        // Disabling keeps the row.
        assert!(!store.get("t1").unwrap().unwrap().enabled);
    }

    #[test]
    fn test_reenable_recomputes_next_run() {
        let store = store();
        let past = Utc::now() - Duration::hours(3);
        store
            .create(NewTask::new("t1", "a", "0 8 * * *", "p").with_next_run_at(past))
            .unwrap();
        store.update("t1", TaskUpdate::enabled(false)).unwrap();
        let task = store.update("t1", TaskUpdate::enabled(true)).unwrap();
        assert!(task.next_run_at.unwrap() > Utc::now());
    }

    #[test]
    fn test_delete_cascades_runs() {
        let store = store();
        store.create(NewTask::new("t1", "a", "* * * * *", "p")).unwrap();
        store.create_run("r1", "t1").unwrap();
        store.create_run("r2", "t1").unwrap();
        store.complete_run("r1", RunStatus::Success, Some("ok")).unwrap();
        assert_eq!(store.list_runs("t1", 10).unwrap().len(), 2);

        store.delete("t1").unwrap();
        assert!(store.list_runs("t1", 10).unwrap().is_empty());
        assert!(store.get_run("r2").unwrap().is_none());

        let err = store.delete("t1").unwrap_err();
        assert!(matches!(err, StewardError::NotFound { .. }));
    }

    #[test]
    fn test_run_lifecycle() {
        let store = store();
        store.create(NewTask::new("t1", "a", "* * * * *", "p")).unwrap();
        let run = store.create_run("r1", "t1").unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());

        store.complete_run("r1", RunStatus::Error, Some("boom")).unwrap();
        let done = store.get_run("r1").unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Error);
        assert_eq!(done.result.as_deref(), Some("boom"));
        assert!(done.finished_at.is_some());

        assert!(matches!(
            store.complete_run("r1", RunStatus::Running, None).unwrap_err(),
            StewardError::Validation(_)
        ));
        assert!(matches!(
            store.complete_run("ghost", RunStatus::Success, None).unwrap_err(),
            StewardError::NotFound { .. }
        ));
        assert!(matches!(
            store.create_run("r9", "ghost").unwrap_err(),
            StewardError::NotFound { .. }
        ));
    }

    #[test]
    fn test_list_runs_most_recent_first_and_limited() {
        let store = store();
        store.create(NewTask::new("t1", "a", "* * * * *", "p")).unwrap();
        for i in 0..5 {
            store.create_run(&format!("r{i}"), "t1").unwrap();
        }
        let runs = store.list_runs("t1", 3).unwrap();
        let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r4", "r3", "r2"]);
    }

    #[test]
    fn test_fail_interrupted_runs() {
        let store = store();
        store.create(NewTask::new("t1", "a", "* * * * *", "p")).unwrap();
        store.create_run("r1", "t1").unwrap();
        store.create_run("r2", "t1").unwrap();
        store.complete_run("r2", RunStatus::Success, Some("ok")).unwrap();

        assert_eq!(store.fail_interrupted_runs().unwrap(), 1);
        let r1 = store.get_run("r1").unwrap().unwrap();
        assert_eq!(r1.status, RunStatus::Error);
        assert_eq!(r1.result.as_deref(), Some(INTERRUPTED_MESSAGE));
        assert!(r1.finished_at.is_some());
        assert_eq!(store.get_run("r2").unwrap().unwrap().status, RunStatus::Success);
    }

    #[test]
    fn test_prune_runs() {
        let store = store();
        store.create(NewTask::new("t1", "a", "* * * * *", "p")).unwrap();
        for i in 0..4 {
            store.create_run(&format!("r{i}"), "t1").unwrap();
        }
        assert_eq!(store.prune_runs("t1", 2).unwrap(), 2);
        let ids: Vec<String> =
            store.list_runs("t1", 10).unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["r3", "r2"]);
    }

    #[test]
    fn test_corrupt_delivery_config_is_storage_error() {
        let db = Database::open_in_memory().unwrap();
        let store = TaskStore::new(db.clone());
        let task = NewTask::new("t1", "a", "0 8 * * *", "p");
        store.create(task.with_delivery(json!({"type": "email"}))).unwrap();
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET delivery_config = '{broken' WHERE id = 't1'",
                [],
            )
        })
        .unwrap();

        assert!(matches!(store.get("t1"), Err(StewardError::Storage(_))));
        assert!(matches!(store.list(), Err(StewardError::Storage(_))));
    }

    #[test]
    fn test_record_fire_and_counts() {
        let store = store();
        store.create(NewTask::new("t1", "a", "* * * * *", "p")).unwrap();
        store.create(NewTask::new("t2", "b", "* * * * *", "p")).unwrap();
        store.update("t2", TaskUpdate::enabled(false)).unwrap();
        assert_eq!(store.counts().unwrap(), (2, 1));

        let now = Utc::now();
        let next = now + Duration::minutes(1);
        store.record_fire("t1", now, Some(next)).unwrap();
        let task = store.get("t1").unwrap().unwrap();
        assert_eq!(task.last_run_at.map(|t| t.timestamp_millis()), Some(now.timestamp_millis()));
        assert_eq!(task.next_run_at.map(|t| t.timestamp_millis()), Some(next.timestamp_millis()));
    }
}
