//! Task definitions — the core data model for scheduled work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use steward_core::error::{Result, StewardError};

use crate::cron::CronSchedule;

/// A scheduled task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// 5-field cron expression, evaluated in UTC.
    pub cron_expression: String,
    /// Prompt sent to the executor when the task fires.
    pub prompt: String,
    /// Where the result should go, e.g. `{"type":"slack","channel":"#digest"}`.
    /// Opaque to the scheduler beyond rendering it into the prompt.
    pub delivery: Option<serde_json::Value>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Parsed schedule for this task.
    pub fn schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.cron_expression)
    }

    /// Enabled and its next fire has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at.is_some_and(|next| next <= now)
    }
}

/// Input for `TaskStore::create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub prompt: String,
    #[serde(default)]
    pub delivery: Option<serde_json::Value>,
    /// Override for the first fire; computed from the cron expression when absent.
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn new(id: &str, name: &str, cron_expression: &str, prompt: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            cron_expression: cron_expression.to_string(),
            prompt: prompt.to_string(),
            delivery: None,
            next_run_at: None,
        }
    }

    pub fn with_delivery(mut self, delivery: serde_json::Value) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn with_next_run_at(mut self, next_run_at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(next_run_at);
        self
    }
}

/// Partial update: only `Some` fields are written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    /// `Some(None)` clears the delivery config.
    #[serde(default, with = "double_option", skip_serializing_if = "Option::is_none")]
    pub delivery: Option<Option<serde_json::Value>>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.cron_expression.is_none()
            && self.prompt.is_none()
            && self.delivery.is_none()
            && self.enabled.is_none()
    }

    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Self::default()
        }
    }
}

/// Distinguishes a missing `delivery` key from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Option<serde_json::Value>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<serde_json::Value>>, D::Error> {
        Option::<serde_json::Value>::deserialize(deserializer).map(Some)
    }
}

/// Execution run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StewardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            other => Err(StewardError::validation(format!("unknown run status '{other}'"))),
        }
    }
}

/// One execution of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: String,
    pub task_id: String,
    pub status: RunStatus,
    /// Response text or failure message, truncated for storage.
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set exactly when `status` is no longer `Running`.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Cut `text` to at most `max_chars` characters, marking the cut.
pub fn truncate_result(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("… [truncated]");
    cut
}
