//! The pluggable storage contract (§4.1).
//!
//! Unlike a dumb get/put/CAS trait, `atomic_fetch_and_lease` and
//! `reap_sweep` must atomically select among many candidate tasks, not
//! just compare-and-swap one known key — so the contract is domain-aware
//! at the trait boundary. See DESIGN.md for the tradeoff record. Backend
//! implementations live in sibling modules: [`memory`] (always available),
//! [`file`] (always available), and the optional [`redis`] / [`dynamodb`]
//! backends.

pub mod file;
pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(feature = "dynamodb")]
pub mod dynamodb;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::domain::{Project, ProjectPatch, Session, Task, TaskType, TaskTypePatch};
use crate::error::Result;
use crate::ids::{ProjectId, SessionToken, TaskId, TaskTypeId};

/// Optional filters for `list_tasks` (§6).
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<crate::domain::TaskStatus>,
    pub type_id: Option<TaskTypeId>,
    pub assigned_to: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Result of a reaper sweep or an equivalent batched reclaim (§4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    pub reclaimed_tasks: usize,
    pub cleaned_agents: usize,
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    // ---- Projects ----
    async fn create_project(&self, project: Project) -> Result<Project>;
    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>>;
    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>>;
    async fn list_projects(&self, include_closed: bool) -> Result<Vec<Project>>;
    async fn update_project(&self, id: &ProjectId, patch: ProjectPatch, now: DateTime<Utc>) -> Result<Project>;
    async fn delete_project(&self, id: &ProjectId) -> Result<bool>;

    // ---- Task types ----
    async fn create_task_type(&self, task_type: TaskType) -> Result<TaskType>;
    async fn get_task_type(&self, id: &TaskTypeId) -> Result<Option<TaskType>>;
    async fn get_task_type_by_name(&self, project_id: &ProjectId, name: &str) -> Result<Option<TaskType>>;
    async fn list_task_types(&self, project_id: &ProjectId) -> Result<Vec<TaskType>>;
    async fn update_task_type(&self, id: &TaskTypeId, patch: TaskTypePatch) -> Result<TaskType>;
    async fn delete_task_type(&self, id: &TaskTypeId) -> Result<bool>;

    // ---- Tasks: plain CRUD ----
    async fn insert_queued_task(&self, task: Task) -> Result<Task>;
    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>>;
    async fn list_tasks(&self, project_id: &ProjectId, filter: TaskFilter) -> Result<Vec<Task>>;
    async fn update_task(&self, id: &TaskId, patch: crate::domain::TaskPatch) -> Result<Task>;
    async fn delete_task(&self, id: &TaskId) -> Result<bool>;

    // ---- Tasks: atomic primitives (§4.1) ----
    async fn atomic_fetch_and_lease(
        &self,
        project_id: &ProjectId,
        agent_name: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<Task>>;

    async fn atomic_complete(&self, task_id: &TaskId, agent_name: &str, result: Value, now: DateTime<Utc>) -> Result<Task>;

    async fn atomic_fail(
        &self,
        task_id: &TaskId,
        agent_name: &str,
        result: Value,
        can_retry: bool,
        now: DateTime<Utc>,
    ) -> Result<Task>;

    async fn atomic_extend_lease(
        &self,
        task_id: &TaskId,
        agent_name: &str,
        additional: Duration,
        now: DateTime<Utc>,
    ) -> Result<Task>;

    async fn atomic_find_duplicate(
        &self,
        project_id: &ProjectId,
        type_id: &TaskTypeId,
        variables: &HashMap<String, String>,
    ) -> Result<Option<Task>>;

    /// Reclaims every `running` task in `project_id` whose lease has
    /// expired, as if `atomic_fail(.., can_retry = true, ..)` had been
    /// called on each. Must share the same per-project serialization as
    /// `atomic_fetch_and_lease` so a task is never reclaimed twice.
    async fn reap_sweep(&self, project_id: &ProjectId, now: DateTime<Utc>) -> Result<ReapOutcome>;

    // ---- Sessions ----
    async fn create_session(&self, session: Session, resume_existing: bool) -> Result<Session>;
    async fn get_session(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<Session>>;
    async fn update_session_data(
        &self,
        token: &SessionToken,
        data: HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Session>;
    async fn delete_session(&self, token: &SessionToken) -> Result<bool>;
    async fn find_sessions_by_agent(&self, agent_name: &str, project_id: &ProjectId) -> Result<Vec<Session>>;
    async fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize>;
}
