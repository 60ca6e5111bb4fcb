//! Scheduler engine — one tokio timer per enabled task.
//!
//! Timers sleep until the task's next cron slot, then hand the work to a
//! detached execution task and wait for it before rearming, so a task never
//! overlaps itself while different tasks run freely in parallel. A missed slot
//! caught up at start is run by the task's own timer before its first sleep.
//! Aborting a timer (`stop`, `reload`, `remove`) never interrupts an execution
//! in flight; the registry's in-flight set keeps a re-armed timer from
//! starting a second run of the same task until the first one finishes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use steward_core::PromptExecutor;
use steward_core::config::SchedulerConfig;
use steward_core::error::{Result, StewardError};

use crate::cron::CronSchedule;
use crate::delivery::effective_prompt;
use crate::manager::TaskReloader;
use crate::store::TaskStore;
use crate::tasks::{RunStatus, Task, truncate_result};

#[derive(Debug)]
struct ArmedTimer {
    handle: JoinHandle<()>,
    /// `updated_at` of the task when the timer was armed.
    version: DateTime<Utc>,
}

/// Armed timers by task id. Owned by one scheduler instance.
///
/// The open flag lives here so that checking it and inserting a timer happen
/// under the same lock: once `close` returns, nothing can be armed again until
/// the next `open`.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    timers: HashMap<String, ArmedTimer>,
    in_flight: HashSet<String>,
    open: bool,
}

impl TimerRegistry {
    /// Accept timers. False if the registry was already open.
    pub fn open(&mut self) -> bool {
        !std::mem::replace(&mut self.open, true)
    }

    /// Stop accepting timers and abort the armed ones. False if already closed.
    pub fn close(&mut self) -> bool {
        let was_open = std::mem::replace(&mut self.open, false);
        self.clear();
        was_open
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Register a timer, aborting any previous one for the same task.
    /// A closed registry aborts the new timer instead and returns false.
    pub fn arm(&mut self, task_id: String, version: DateTime<Utc>, handle: JoinHandle<()>) -> bool {
        if !self.open {
            handle.abort();
            return false;
        }
        if let Some(old) = self.timers.insert(task_id, ArmedTimer { handle, version }) {
            old.handle.abort();
        }
        true
    }

    /// Abort and forget a task's timer. True if one was armed.
    pub fn disarm(&mut self, task_id: &str) -> bool {
        match self.timers.remove(task_id) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Armed task ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.timers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Task version each armed timer was built from.
    pub fn versions(&self) -> HashMap<String, DateTime<Utc>> {
        self.timers
            .iter()
            .map(|(id, timer)| (id.clone(), timer.version))
            .collect()
    }

    /// Mark a scheduled run as started. False while closed or when the task
    /// already has a run in flight.
    pub fn begin_run(&mut self, task_id: &str) -> bool {
        self.open && self.in_flight.insert(task_id.to_string())
    }

    pub fn finish_run(&mut self, task_id: &str) {
        self.in_flight.remove(task_id);
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Cron scheduler. Cheap to clone; clones share timers and state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: TaskStore,
    executor: Arc<dyn PromptExecutor>,
    config: SchedulerConfig,
    timers: Mutex<TimerRegistry>,
    /// Interrupted-run recovery happens once per instance, on the first start.
    recovered: AtomicBool,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("executor", &self.inner.executor.name())
            .field("running", &self.is_running())
            .field("armed", &self.armed_tasks())
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        store: TaskStore,
        executor: Arc<dyn PromptExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                executor,
                config,
                timers: Mutex::new(TimerRegistry::default()),
                recovered: AtomicBool::new(false),
            }),
        }
    }

    /// Arm a timer for every enabled task. No-op if already running.
    pub async fn start(&self) -> Result<()> {
        if !self.inner.timers().open() {
            return Ok(());
        }
        if let Err(e) = self.start_inner() {
            self.inner.timers().close();
            return Err(e);
        }
        tracing::info!(
            "⏰ Scheduler started ({} timer(s) armed, executor: {})",
            self.inner.timers().len(),
            self.inner.executor.name()
        );
        Ok(())
    }

    fn start_inner(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.recovered.swap(true, Ordering::SeqCst) {
            inner.store.fail_interrupted_runs()?;
        }

        let now = Utc::now();
        for task in inner.store.list_enabled()? {
            let catch_up = inner.config.catch_up_missed && task.is_due(now);
            match inner.arm(&task, catch_up) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("⚠️ Task '{}' not armed: {e}", task.id),
            }
        }
        Ok(())
    }

    /// Disarm every timer. Executions already in flight finish on their own.
    pub fn stop(&self) {
        if self.inner.timers().close() {
            tracing::info!("⏹️ Scheduler stopped");
        }
    }

    /// Re-read a task after an edit and re-arm it if it is still enabled.
    pub fn reload(&self, task_id: &str) -> Result<()> {
        self.inner.timers().disarm(task_id);
        if !self.is_running() {
            return Ok(());
        }
        match self.inner.store.get(task_id)? {
            Some(task) if task.enabled => self.inner.arm(&task, false),
            Some(_) => {
                tracing::debug!("Task {task_id} is disabled; timer stays disarmed");
                Ok(())
            }
            None => {
                tracing::debug!("Task {task_id} no longer exists; timer dropped");
                Ok(())
            }
        }
    }

    /// Bring the armed timers in line with storage.
    ///
    /// Picks up edits made without going through this instance (another
    /// process sharing the database): new or re-enabled tasks get a timer,
    /// changed tasks are re-armed, and timers of deleted or disabled tasks are
    /// dropped. Returns how many timers changed.
    pub fn reconcile(&self) -> Result<usize> {
        if !self.is_running() {
            return Ok(0);
        }
        let tasks = self.inner.store.list_enabled()?;
        let armed = self.inner.timers().versions();
        let now = Utc::now();
        let mut changed = 0;

        for task in &tasks {
            if armed.get(&task.id) == Some(&task.updated_at) {
                continue;
            }
            let catch_up = self.inner.config.catch_up_missed && task.is_due(now);
            match self.inner.arm(task, catch_up) {
                Ok(()) => changed += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("⚠️ Task '{}' not armed: {e}", task.id),
            }
        }

        let enabled: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
        for id in armed.keys().filter(|id| !enabled.contains(id.as_str())) {
            if self.inner.timers().disarm(id) {
                tracing::info!("🗑️ Timer dropped: {id} (deleted or disabled)");
                changed += 1;
            }
        }

        if changed > 0 {
            tracing::info!("🔄 Reconciled {changed} timer(s) with storage");
        }
        Ok(changed)
    }

    /// Forget a task's timer. Storage is untouched.
    pub fn remove(&self, task_id: &str) {
        if self.inner.timers().disarm(task_id) {
            tracing::info!("🗑️ Timer removed: {task_id}");
        }
    }

    /// Execute a task immediately, outside its schedule.
    /// The run is recorded either way; an executor failure comes back as `Execution`.
    pub async fn run_now(&self, task_id: &str) -> Result<String> {
        let task = self
            .inner
            .store
            .get(task_id)?
            .ok_or_else(|| StewardError::not_found("task", task_id))?;
        tracing::info!("▶️ Manual run: '{}' ({})", task.name, task.id);
        self.inner.execute_task(&task, None).await
    }

    pub fn is_running(&self) -> bool {
        self.inner.timers().is_open()
    }

    /// Ids of tasks with an armed timer, sorted.
    pub fn armed_tasks(&self) -> Vec<String> {
        self.inner.timers().ids()
    }
}

#[async_trait]
impl TaskReloader for Scheduler {
    async fn reload(&self, task_id: &str) -> Result<()> {
        Scheduler::reload(self, task_id)
    }

    fn remove(&self, task_id: &str) {
        Scheduler::remove(self, task_id)
    }

    async fn run_now(&self, task_id: &str) -> Result<String> {
        Scheduler::run_now(self, task_id).await
    }
}

/// Clears a task's in-flight mark when its scheduled run ends.
struct InFlight {
    inner: Arc<SchedulerInner>,
    task_id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.inner.timers().finish_run(&self.task_id);
    }
}

impl SchedulerInner {
    fn timers(&self) -> MutexGuard<'_, TimerRegistry> {
        // The registry holds no invariants a panic could break.
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Arm a task's timer. With `catch_up` the timer first runs the missed
    /// slot, then continues with the regular schedule.
    fn arm(self: &Arc<Self>, task: &Task, catch_up: bool) -> Result<()> {
        let schedule = task.schedule()?;
        let now = Utc::now();
        let first = match task.next_run_at.filter(|next| *next > now) {
            Some(next) => next,
            None => match schedule.next_after(now) {
                Some(next) => next,
                None => {
                    tracing::warn!("⚠️ Task '{}' has no upcoming fire time", task.id);
                    return Ok(());
                }
            },
        };
        if task.next_run_at != Some(first) {
            self.store.set_next_run_at(&task.id, Some(first))?;
        }

        let armed = {
            let mut timers = self.timers();
            timers.is_open()
                && timers.arm(
                    task.id.clone(),
                    task.updated_at,
                    tokio::spawn(run_timer(
                        Arc::downgrade(self),
                        task.id.clone(),
                        schedule,
                        first,
                        catch_up.then_some(now),
                    )),
                )
        };
        if !armed {
            tracing::debug!("Scheduler stopped; timer for {} not armed", task.id);
            return Ok(());
        }
        if catch_up {
            tracing::info!("⏪ Catching up missed run of '{}' ({})", task.name, task.id);
        }
        tracing::info!(
            "⏱️ Timer armed: '{}' ({}) next at {}",
            task.name,
            task.id,
            first.to_rfc3339()
        );
        Ok(())
    }

    /// Timer entry point: skips tasks that vanished or were disabled meanwhile.
    async fn fire(self: Arc<Self>, task_id: String, fired_at: DateTime<Utc>) {
        if !self.timers().begin_run(&task_id) {
            tracing::debug!("Task {task_id} still running or scheduler stopped; slot skipped");
            return;
        }
        let _in_flight = InFlight {
            inner: Arc::clone(&self),
            task_id: task_id.clone(),
        };

        let task = match self.store.get(&task_id) {
            Ok(Some(task)) if task.enabled => task,
            Ok(_) => {
                tracing::debug!("Task {task_id} gone or disabled; skipping fire");
                return;
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not load task {task_id}: {e}");
                return;
            }
        };
        tracing::info!("🔔 Task fired: '{}' ({})", task.name, task.id);
        if let Err(e) = self.execute_task(&task, Some(fired_at)).await {
            tracing::warn!("⚠️ Task '{}' failed: {e}", task.name);
        }
    }

    /// Run a task once and record the outcome.
    ///
    /// `fired_at` is the cron slot for timer fires and `None` for manual runs;
    /// a manual run keeps an upcoming `next_run_at` as it is.
    async fn execute_task(
        &self,
        task: &Task,
        fired_at: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let run_id = uuid::Uuid::new_v4().to_string();
        self.store.create_run(&run_id, &task.id)?;

        let prompt = effective_prompt(&task.prompt, task.delivery.as_ref());
        let executor = Arc::clone(&self.executor);
        let outcome = match tokio::spawn(async move { executor.execute(&prompt).await }).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(StewardError::execution("executor panicked")),
            Err(e) => Err(StewardError::execution(e)),
        };

        let outcome = match outcome {
            Ok(text) => {
                let stored = truncate_result(&text, self.config.max_result_chars);
                self.store.complete_run(&run_id, RunStatus::Success, Some(&stored))?;
                let chars = text.chars().count();
                tracing::info!("✅ Run finished: '{}' ({chars} chars)", task.name);
                Ok(text)
            }
            Err(e) => {
                let message = match e {
                    StewardError::Execution(message) => message,
                    other => other.to_string(),
                };
                let stored = truncate_result(&message, self.config.max_result_chars);
                self.store.complete_run(&run_id, RunStatus::Error, Some(&stored))?;
                Err(StewardError::Execution(message))
            }
        };

        let now = Utc::now();
        let next_run_at = match (task.enabled, fired_at) {
            (true, Some(at)) => task.schedule()?.next_after(at.max(now)),
            (true, None) => match task.next_run_at.filter(|next| *next > now) {
                Some(next) => Some(next),
                None => task.schedule()?.next_after(now),
            },
            (false, _) => task.next_run_at,
        };
        self.store.record_fire(&task.id, now, next_run_at)?;

        if self.config.run_history_limit > 0 {
            let pruned = self.store.prune_runs(&task.id, self.config.run_history_limit)?;
            if pruned > 0 {
                tracing::debug!("Pruned {pruned} old run(s) of {}", task.id);
            }
        }
        outcome
    }
}

/// Fire one slot on a detached task and wait for it. False once the
/// scheduler is gone.
async fn fire_and_wait(inner: &Weak<SchedulerInner>, task_id: &str, at: DateTime<Utc>) -> bool {
    let Some(strong) = inner.upgrade() else {
        return false;
    };
    let execution = tokio::spawn(strong.fire(task_id.to_string(), at));
    if let Err(e) = execution.await {
        tracing::error!("💥 Execution of task {task_id} panicked: {e}");
    }
    true
}

/// Run the missed slot if any, then sleep until each slot, fire, and rearm
/// strictly after the slot just fired.
async fn run_timer(
    inner: Weak<SchedulerInner>,
    task_id: String,
    schedule: CronSchedule,
    mut fire_at: DateTime<Utc>,
    catch_up: Option<DateTime<Utc>>,
) {
    if let Some(missed_at) = catch_up {
        if !fire_and_wait(&inner, &task_id, missed_at).await {
            return;
        }
        // Slots that passed during the catch-up run are skipped.
        let now = Utc::now();
        if fire_at <= now {
            match schedule.next_after(now) {
                Some(next) => fire_at = next,
                None => return,
            }
        }
    }

    loop {
        let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(delay).await;

        if !fire_and_wait(&inner, &task_id, fire_at).await {
            return;
        }

        match schedule.next_after(fire_at.max(Utc::now())) {
            Some(next) => fire_at = next,
            None => {
                tracing::warn!("⚠️ Task {task_id} has no further fire times; timer exits");
                return;
            }
        }
    }
}
