//! # Steward Scheduler
//!
//! Cron-driven background tasks for the assistant: a task store with run
//! history on top of the shared SQLite engine, and a timer-per-task scheduler
//! that hands prompts to the agent.
//!
//! ## Architecture
//! ```text
//! TaskManager (chat / HTTP tools)
//!   ├── TaskStore ── scheduled_tasks, task_runs (SQLite)
//!   └── TaskReloader ─▶ Scheduler
//!                         ├── TimerRegistry: task id → tokio timer
//!                         ├── reconcile: re-arm from storage (other processes)
//!                         └── on fire → effective_prompt → PromptExecutor
//!                                         └── run recorded (success / error)
//! ```

pub mod cron;
pub mod delivery;
pub mod engine;
pub mod manager;
pub mod store;
pub mod tasks;

pub use cron::CronSchedule;
pub use engine::{Scheduler, TimerRegistry};
pub use manager::{TaskManager, TaskReloader};
pub use store::TaskStore;
pub use tasks::{NewTask, RunStatus, Task, TaskRun, TaskUpdate};
