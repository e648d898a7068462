//! In-process backend. Each project's mutating task operations serialize
//! through a `parking_lot::Mutex` keyed by project id, directly — there is
//! no remote round trip to batch into a script, so the critical section is
//! just ordinary scan-then-mutate Rust code.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::domain::{Project, ProjectPatch, Session, Task, TaskPatch, TaskStatus, TaskType, TaskTypePatch};
use crate::error::{BrokerError, Result};
use crate::ids::{ProjectId, SessionToken, TaskId, TaskTypeId};

use super::{ReapOutcome, StorageBackend, TaskFilter};

#[derive(Debug, Default)]
pub struct MemoryBackend {
    projects: DashMap<ProjectId, Project>,
    project_names: DashMap<String, ProjectId>,
    task_types: DashMap<TaskTypeId, TaskType>,
    tasks: DashMap<TaskId, Task>,
    sessions: DashMap<SessionToken, Session>,
    project_locks: DashMap<ProjectId, Arc<Mutex<()>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, project_id: &ProjectId) -> Arc<Mutex<()>> {
        self.project_locks
            .entry(project_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn tasks_in_project(&self, project_id: &ProjectId) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|entry| &entry.project_id == project_id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn create_project(&self, project: Project) -> Result<Project> {
        if self.project_names.contains_key(&project.name) {
            return Err(BrokerError::already_exists("project", project.name.clone()));
        }
        self.project_names.insert(project.name.clone(), project.id.clone());
        self.projects.insert(project.id.clone(), project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        Ok(self.projects.get(id).map(|p| p.clone()))
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        match self.project_names.get(name) {
            Some(id) => self.get_project(&id).await,
            None => Ok(None),
        }
    }

    async fn list_projects(&self, include_closed: bool) -> Result<Vec<Project>> {
        Ok(self
            .projects
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|p| include_closed || p.status == crate::domain::ProjectStatus::Active)
            .collect())
    }

    async fn update_project(&self, id: &ProjectId, patch: ProjectPatch, now: DateTime<Utc>) -> Result<Project> {
        let mut project = self
            .projects
            .get_mut(id)
            .ok_or_else(|| BrokerError::not_found("project", id.to_string()))?;
        project.apply(patch, now);
        Ok(project.clone())
    }

    async fn delete_project(&self, id: &ProjectId) -> Result<bool> {
        let Some((_, project)) = self.projects.remove(id) else {
            return Ok(false);
        };
        self.project_names.remove(&project.name);
        self.task_types.retain(|_, tt| &tt.project_id != id);
        self.tasks.retain(|_, t| &t.project_id != id);
        self.project_locks.remove(id);
        Ok(true)
    }

    async fn create_task_type(&self, task_type: TaskType) -> Result<TaskType> {
        let exists = self
            .task_types
            .iter()
            .any(|tt| tt.project_id == task_type.project_id && tt.name == task_type.name);
        if exists {
            return Err(BrokerError::already_exists("task_type", task_type.name.clone()));
        }
        self.task_types.insert(task_type.id.clone(), task_type.clone());
        Ok(task_type)
    }

    async fn get_task_type(&self, id: &TaskTypeId) -> Result<Option<TaskType>> {
        Ok(self.task_types.get(id).map(|tt| tt.clone()))
    }

    async fn get_task_type_by_name(&self, project_id: &ProjectId, name: &str) -> Result<Option<TaskType>> {
        Ok(self
            .task_types
            .iter()
            .find(|tt| &tt.project_id == project_id && tt.name == name)
            .map(|tt| tt.clone()))
    }

    async fn list_task_types(&self, project_id: &ProjectId) -> Result<Vec<TaskType>> {
        Ok(self
            .task_types
            .iter()
            .filter(|tt| &tt.project_id == project_id)
            .map(|tt| tt.clone())
            .collect())
    }

    async fn update_task_type(&self, id: &TaskTypeId, patch: TaskTypePatch) -> Result<TaskType> {
        let mut task_type = self
            .task_types
            .get_mut(id)
            .ok_or_else(|| BrokerError::not_found("task_type", id.to_string()))?;
        task_type.apply(patch)?;
        Ok(task_type.clone())
    }

    async fn delete_task_type(&self, id: &TaskTypeId) -> Result<bool> {
        Ok(self.task_types.remove(id).is_some())
    }

    async fn insert_queued_task(&self, task: Task) -> Result<Task> {
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.get(id).map(|t| t.clone()))
    }

    async fn list_tasks(&self, project_id: &ProjectId, filter: TaskFilter) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|entry| &entry.project_id == project_id)
            .map(|entry| entry.value().clone())
            .filter(|t| filter.status.map(|s| s == t.status).unwrap_or(true))
            .filter(|t| filter.type_id.as_ref().map(|id| id == &t.type_id).unwrap_or(true))
            .filter(|t| {
                filter
                    .assigned_to
                    .as_ref()
                    .map(|a| t.assigned_to.as_deref() == Some(a.as_str()))
                    .unwrap_or(true)
            })
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        let offset = filter.offset.unwrap_or(0);
        let tasks = tasks.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => tasks.take(limit).collect(),
            None => tasks.collect(),
        })
    }

    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        let mut task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| BrokerError::not_found("task", id.to_string()))?;
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(variables) = patch.variables {
            task.variables = variables;
        }
        Ok(task.clone())
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        Ok(self.tasks.remove(id).is_some())
    }

    async fn atomic_fetch_and_lease(
        &self,
        project_id: &ProjectId,
        agent_name: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<Task>> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock();

        // Session-scoped resumption (§4.2): an agent already holding a
        // non-expired lease in this project gets that task back.
        if let Some(resumed) = self.tasks.iter().find(|entry| {
            &entry.project_id == project_id
                && entry.status == TaskStatus::Running
                && entry.assigned_to.as_deref() == Some(agent_name)
                && entry.lease_expires_at.map(|e| e > now).unwrap_or(false)
        }) {
            return Ok(Some(resumed.value().clone()));
        }

        let mut candidates = self.tasks_in_project(project_id);
        candidates.retain(|t| t.is_fetchable(now));
        candidates.sort_by_key(|t| t.created_at);

        let Some(chosen) = candidates.into_iter().next() else {
            return Ok(None);
        };

        let mut task = self.tasks.get_mut(&chosen.id).expect("candidate vanished under lock");
        task.lease_to(agent_name, now, lease_duration);
        Ok(Some(task.clone()))
    }

    async fn atomic_complete(&self, task_id: &TaskId, agent_name: &str, result: Value, now: DateTime<Utc>) -> Result<Task> {
        let lock = self.lock_for(&self.require_project_id(task_id)?);
        let _guard = lock.lock();
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::not_found("task", task_id.to_string()))?;
        ensure_assigned(&task, agent_name)?;
        ensure_running(&task)?;
        task.complete(result, now);
        Ok(task.clone())
    }

    async fn atomic_fail(
        &self,
        task_id: &TaskId,
        agent_name: &str,
        result: Value,
        can_retry: bool,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let lock = self.lock_for(&self.require_project_id(task_id)?);
        let _guard = lock.lock();
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::not_found("task", task_id.to_string()))?;
        ensure_assigned(&task, agent_name)?;
        ensure_running(&task)?;
        task.fail(result, can_retry, now);
        Ok(task.clone())
    }

    async fn atomic_extend_lease(
        &self,
        task_id: &TaskId,
        agent_name: &str,
        additional: Duration,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        let lock = self.lock_for(&self.require_project_id(task_id)?);
        let _guard = lock.lock();
        let mut task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| BrokerError::not_found("task", task_id.to_string()))?;
        ensure_assigned(&task, agent_name)?;
        ensure_running(&task)?;
        let _ = now;
        task.extend_lease(additional);
        Ok(task.clone())
    }

    async fn atomic_find_duplicate(
        &self,
        project_id: &ProjectId,
        type_id: &TaskTypeId,
        variables: &HashMap<String, String>,
    ) -> Result<Option<Task>> {
        Ok(self
            .tasks
            .iter()
            .find(|t| {
                &t.project_id == project_id
                    && &t.type_id == type_id
                    && t.status != TaskStatus::Failed
                    && t.variables_match(variables)
            })
            .map(|t| t.clone()))
    }

    async fn reap_sweep(&self, project_id: &ProjectId, now: DateTime<Utc>) -> Result<ReapOutcome> {
        let lock = self.lock_for(project_id);
        let _guard = lock.lock();

        let mut reclaimed_tasks = 0usize;
        let mut agents_reclaimed = std::collections::HashSet::new();
        for mut entry in self.tasks.iter_mut() {
            if &entry.project_id != project_id {
                continue;
            }
            let expired = entry.status == TaskStatus::Running
                && entry.lease_expires_at.map(|e| e <= now).unwrap_or(false);
            if !expired {
                continue;
            }
            if let Some(agent) = entry.assigned_to.clone() {
                agents_reclaimed.insert(agent);
            }
            entry.reclaim_expired(now);
            reclaimed_tasks += 1;
        }

        let mut agents_with_remaining_running = std::collections::HashSet::new();
        for entry in self.tasks.iter() {
            if &entry.project_id == project_id && entry.status == TaskStatus::Running {
                if let Some(agent) = &entry.assigned_to {
                    agents_with_remaining_running.insert(agent.clone());
                }
            }
        }
        let cleaned_agents = agents_reclaimed
            .into_iter()
            .filter(|a| !agents_with_remaining_running.contains(a))
            .count();

        Ok(ReapOutcome {
            reclaimed_tasks,
            cleaned_agents,
        })
    }

    async fn create_session(&self, session: Session, resume_existing: bool) -> Result<Session> {
        if resume_existing {
            if let Some(existing) = self.sessions.iter().find(|s| {
                s.agent_name == session.agent_name && s.project_id == session.project_id && !s.is_expired(session.created_at)
            }) {
                return Ok(existing.value().clone());
            }
        }
        self.sessions.insert(session.token.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<Session>> {
        let Some(mut session) = self.sessions.get_mut(token) else {
            return Ok(None);
        };
        if session.is_expired(now) {
            drop(session);
            self.sessions.remove(token);
            return Ok(None);
        }
        session.touch(now);
        Ok(Some(session.clone()))
    }

    async fn update_session_data(
        &self,
        token: &SessionToken,
        data: HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let mut session = self
            .sessions
            .get_mut(token)
            .ok_or_else(|| BrokerError::not_found("session", token.to_string()))?;
        session.data = data;
        session.touch(now);
        Ok(session.clone())
    }

    async fn delete_session(&self, token: &SessionToken) -> Result<bool> {
        Ok(self.sessions.remove(token).is_some())
    }

    async fn find_sessions_by_agent(&self, agent_name: &str, project_id: &ProjectId) -> Result<Vec<Session>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.agent_name == agent_name && &s.project_id == project_id)
            .map(|s| s.clone())
            .collect())
    }

    async fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired: Vec<SessionToken> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(now))
            .map(|s| s.token.clone())
            .collect();
        let count = expired.len();
        for token in expired {
            self.sessions.remove(&token);
        }
        Ok(count)
    }
}

impl MemoryBackend {
    fn require_project_id(&self, task_id: &TaskId) -> Result<ProjectId> {
        self.tasks
            .get(task_id)
            .map(|t| t.project_id.clone())
            .ok_or_else(|| BrokerError::not_found("task", task_id.to_string()))
    }
}

fn ensure_assigned(task: &Task, agent_name: &str) -> Result<()> {
    if task.assigned_to.as_deref() != Some(agent_name) {
        return Err(BrokerError::NotAssignedToAgent {
            task_id: task.id.clone(),
            agent: agent_name.to_string(),
        });
    }
    Ok(())
}

fn ensure_running(task: &Task) -> Result<()> {
    if task.status != TaskStatus::Running {
        return Err(BrokerError::InvalidState {
            task_id: task.id.clone(),
            expected: "running",
            actual: match task.status {
                TaskStatus::Queued => "queued",
                TaskStatus::Running => "running",
                TaskStatus::Completed => "completed",
                TaskStatus::Failed => "failed",
            },
        });
    }
    Ok(())
}
