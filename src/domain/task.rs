use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ProjectId, TaskId, TaskTypeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Running,
    Completed,
    Failed,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub attempt_id: String,
    pub agent_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: AttemptStatus,
    pub result: Option<Value>,
}

impl TaskAttempt {
    pub fn open(agent_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            agent_name: agent_name.into(),
            started_at: now,
            completed_at: None,
            status: AttemptStatus::Running,
            result: None,
        }
    }

    pub fn close(&mut self, status: AttemptStatus, result: Option<Value>, now: DateTime<Utc>) {
        self.status = status;
        self.result = result;
        self.completed_at = Some(now);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub type_id: TaskTypeId,
    pub description: Option<String>,
    pub variables: HashMap<String, String>,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: Vec<TaskAttempt>,
    pub result: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new_queued(
        id: TaskId,
        project_id: ProjectId,
        type_id: TaskTypeId,
        description: Option<String>,
        variables: HashMap<String, String>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            project_id,
            type_id,
            description,
            variables,
            status: TaskStatus::Queued,
            retry_count: 0,
            max_retries,
            assigned_to: None,
            assigned_at: None,
            lease_expires_at: None,
            attempts: Vec::new(),
            result: None,
            created_at: now,
            completed_at: None,
            failed_at: None,
        }
    }

    /// True under the fetch policy of §4.2: queued-and-under-budget, or
    /// running-with-an-expired-lease.
    pub fn is_fetchable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Queued => self.retry_count <= self.max_retries,
            TaskStatus::Running => self
                .lease_expires_at
                .map(|expires| expires <= now)
                .unwrap_or(false),
            TaskStatus::Completed | TaskStatus::Failed => false,
        }
    }

    /// Transitions this task to `running`, closing any still-open prior
    /// attempt as `expired` (the reclaim-on-fetch path of §4.2) and
    /// opening a new attempt for `agent_name`.
    pub fn lease_to(&mut self, agent_name: impl Into<String>, now: DateTime<Utc>, lease_duration: chrono::Duration) {
        if let Some(last) = self.attempts.last_mut() {
            if last.status == AttemptStatus::Running {
                last.close(AttemptStatus::Expired, None, now);
            }
        }
        let agent_name = agent_name.into();
        self.status = TaskStatus::Running;
        self.assigned_to = Some(agent_name.clone());
        self.assigned_at = Some(now);
        self.lease_expires_at = Some(now + lease_duration);
        self.attempts.push(TaskAttempt::open(agent_name, now));
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) {
        if let Some(last) = self.attempts.last_mut() {
            last.close(AttemptStatus::Completed, Some(result.clone()), now);
        }
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.clear_lease();
    }

    /// `can_retry && retry_count+1 <= max_retries` requeues; otherwise
    /// terminally fails, per I3's `retry_count == attempts.len()` pick.
    pub fn fail(&mut self, result: Value, can_retry: bool, now: DateTime<Utc>) {
        let new_count = self.retry_count + 1;
        if let Some(last) = self.attempts.last_mut() {
            last.close(AttemptStatus::Failed, Some(result.clone()), now);
        }
        self.retry_count = new_count;
        if can_retry && new_count <= self.max_retries {
            self.status = TaskStatus::Queued;
            self.result = Some(result);
            self.clear_lease();
        } else {
            self.status = TaskStatus::Failed;
            self.result = Some(result);
            self.failed_at = Some(now);
            self.clear_lease();
        }
    }

    /// Reclaim path for the reaper and for fetch-reclaiming an expired
    /// lease without an incoming agent yet assigned — equivalent to
    /// `atomic_fail(task, assigned_to, "lease expired", can_retry=true)`.
    pub fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        let reason = serde_json::json!({ "error": "lease expired" });
        self.fail(reason, true, now);
    }

    pub fn extend_lease(&mut self, additional: chrono::Duration) {
        if let Some(expires) = self.lease_expires_at {
            self.lease_expires_at = Some(expires + additional);
        }
    }

    fn clear_lease(&mut self) {
        self.assigned_to = None;
        self.assigned_at = None;
        self.lease_expires_at = None;
    }

    /// Key-set-and-value equality ignoring order, per §4.2's duplicate
    /// comparison rule. Missing/empty maps compare equal.
    pub fn variables_match(&self, other: &HashMap<String, String>) -> bool {
        self.variables == *other
    }
}

/// A partial update to a task's mutable, non-lease fields.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub description: Option<Option<String>>,
    pub variables: Option<HashMap<String, String>>,
}
