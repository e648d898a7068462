//! The Queue Engine (§4.2) plus the thin wrappers around Storage Contract
//! calls that make up the rest of the external interface (§6). Everything
//! backend-agnostic — template validation, duplicate-policy error
//! shaping, ID/agent-name generation, stats derivation — lives here, one
//! level above [`crate::store::StorageBackend`], mirroring the ancestor
//! crate's `GenericTaskStore<B>` sitting above its dumb `StorageBackend`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::config::BrokerConfig;
use crate::domain::{
    DuplicatePolicy, Project, ProjectPatch, ProjectStats, Session, Task, TaskPatch, TaskStatus, TaskType, TaskTypePatch,
};
use crate::error::{BrokerError, Result};
use crate::ids::{ProjectId, SessionToken, TaskId, TaskTypeId};
use crate::store::{ReapOutcome, StorageBackend, TaskFilter};
use crate::template;

/// Result of `fetch_next` (§6): the leased task, if any, and the agent
/// name that ended up holding it (echoing a server-generated name back to
/// a caller that didn't supply one).
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub task: Option<Task>,
    pub agent_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct BulkCreateResult {
    pub created: Vec<Task>,
    pub errors: Vec<String>,
}

pub struct Broker<B: StorageBackend> {
    backend: Arc<B>,
    config: BrokerConfig,
}

impl<B: StorageBackend> Broker<B> {
    pub fn new(backend: Arc<B>, config: BrokerConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    // ---- Projects ----

    pub async fn create_project(
        &self,
        name: impl Into<String>,
        description: Option<String>,
        instructions: Option<String>,
    ) -> Result<Project> {
        let project = Project::new(name, description, instructions, &self.config, Utc::now());
        self.backend.create_project(project).await
    }

    pub async fn get_project(&self, name_or_id: &str) -> Result<Option<Project>> {
        let id = ProjectId::from_str_unchecked(name_or_id);
        if let Some(project) = self.backend.get_project(&id).await? {
            return Ok(Some(project));
        }
        self.backend.get_project_by_name(name_or_id).await
    }

    pub async fn update_project(&self, id: &ProjectId, patch: ProjectPatch) -> Result<Project> {
        self.backend.update_project(id, patch, Utc::now()).await
    }

    pub async fn list_projects(&self, include_closed: bool) -> Result<Vec<Project>> {
        self.backend.list_projects(include_closed).await
    }

    pub async fn delete_project(&self, id: &ProjectId) -> Result<()> {
        if !self.backend.delete_project(id).await? {
            return Err(BrokerError::not_found("project", id.to_string()));
        }
        Ok(())
    }

    // ---- Task types ----

    #[allow(clippy::too_many_arguments)]
    pub async fn create_task_type(
        &self,
        project_id: ProjectId,
        name: impl Into<String>,
        template: impl Into<String>,
        variables: Vec<String>,
        duplicate_policy: Option<DuplicatePolicy>,
        max_retries: Option<u32>,
        lease_duration_minutes: Option<f64>,
    ) -> Result<TaskType> {
        let project = self
            .backend
            .get_project(&project_id)
            .await?
            .ok_or_else(|| BrokerError::not_found("project", project_id.to_string()))?;
        let task_type = TaskType::new(
            project_id,
            name,
            template,
            variables,
            max_retries.unwrap_or(project.default_max_retries),
            lease_duration_minutes.unwrap_or(project.default_lease_duration_minutes),
            duplicate_policy.unwrap_or_default(),
        )?;
        self.backend.create_task_type(task_type).await
    }

    pub async fn get_task_type(&self, id: &TaskTypeId) -> Result<Option<TaskType>> {
        self.backend.get_task_type(id).await
    }

    pub async fn get_task_type_by_name(&self, project_id: &ProjectId, name_or_id: &str) -> Result<Option<TaskType>> {
        let id = TaskTypeId::from_str_unchecked(name_or_id);
        if let Some(task_type) = self.backend.get_task_type(&id).await? {
            if &task_type.project_id == project_id {
                return Ok(Some(task_type));
            }
        }
        self.backend.get_task_type_by_name(project_id, name_or_id).await
    }

    pub async fn list_task_types(&self, project_id: &ProjectId) -> Result<Vec<TaskType>> {
        self.backend.list_task_types(project_id).await
    }

    pub async fn update_task_type(&self, id: &TaskTypeId, patch: TaskTypePatch) -> Result<TaskType> {
        self.backend.update_task_type(id, patch).await
    }

    pub async fn delete_task_type(&self, id: &TaskTypeId) -> Result<()> {
        if !self.backend.delete_task_type(id).await? {
            return Err(BrokerError::not_found("task_type", id.to_string()));
        }
        Ok(())
    }

    // ---- Tasks ----

    pub async fn create_task(
        &self,
        project_id: ProjectId,
        type_id: TaskTypeId,
        variables: HashMap<String, String>,
        id: Option<TaskId>,
        description: Option<String>,
    ) -> Result<Task> {
        let task_type = self
            .backend
            .get_task_type(&type_id)
            .await?
            .ok_or_else(|| BrokerError::not_found("task_type", type_id.to_string()))?;

        // Validates at create time that every `{{name}}` in the template
        // is bound (§4.2); the resulting string is discarded here, the
        // binding happens lazily when instructions are requested.
        template::bind(&task_type.template, &variables)?;

        if task_type.duplicate_policy != DuplicatePolicy::Allow {
            if let Some(existing) = self
                .backend
                .atomic_find_duplicate(&project_id, &type_id, &variables)
                .await?
            {
                return match task_type.duplicate_policy {
                    DuplicatePolicy::Ignore => Ok(existing),
                    DuplicatePolicy::Fail => Err(BrokerError::DuplicateTask {
                        type_id,
                        variables,
                        existing_task_id: existing.id,
                    }),
                    DuplicatePolicy::Allow => unreachable!(),
                };
            }
        }

        let task_id = id.unwrap_or_else(TaskId::generate);
        let task = Task::new_queued(
            task_id,
            project_id,
            type_id,
            description,
            variables,
            task_type.max_retries,
            Utc::now(),
        );
        self.backend.insert_queued_task(task).await
    }

    pub async fn bulk_create_tasks(
        &self,
        project_id: ProjectId,
        items: Vec<(TaskTypeId, HashMap<String, String>, Option<TaskId>, Option<String>)>,
    ) -> BulkCreateResult {
        let mut result = BulkCreateResult::default();
        for (type_id, variables, id, description) in items {
            match self
                .create_task(project_id.clone(), type_id, variables, id, description)
                .await
            {
                Ok(task) => result.created.push(task),
                Err(err) => result.errors.push(err.to_string()),
            }
        }
        result
    }

    pub async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.backend.get_task(id).await
    }

    pub async fn list_tasks(&self, project_id: &ProjectId, filter: TaskFilter) -> Result<Vec<Task>> {
        self.backend.list_tasks(project_id, filter).await
    }

    pub async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        self.backend.update_task(id, patch).await
    }

    pub async fn delete_task(&self, id: &TaskId) -> Result<()> {
        if !self.backend.delete_task(id).await? {
            return Err(BrokerError::not_found("task", id.to_string()));
        }
        Ok(())
    }

    /// Computes a task's effective instructions by binding its variable
    /// map into its type's template (§4.2).
    pub async fn task_instructions(&self, task: &Task) -> Result<String> {
        let task_type = self
            .backend
            .get_task_type(&task.type_id)
            .await?
            .ok_or_else(|| BrokerError::not_found("task_type", task.type_id.to_string()))?;
        template::bind(&task_type.template, &task.variables)
    }

    // ---- Queue Engine ----

    pub async fn fetch_next(&self, project_id: &ProjectId, agent_name: Option<String>) -> Result<FetchResult> {
        let agent_name = agent_name.unwrap_or_else(generate_agent_name);
        let lease_duration = self.lease_duration_for_project(project_id).await?;
        let task = self
            .backend
            .atomic_fetch_and_lease(project_id, &agent_name, Utc::now(), lease_duration)
            .await?;
        Ok(FetchResult { task, agent_name })
    }

    pub async fn complete(&self, task_id: &TaskId, agent_name: &str, result: Value) -> Result<Task> {
        self.backend.atomic_complete(task_id, agent_name, result, Utc::now()).await
    }

    pub async fn fail(&self, task_id: &TaskId, agent_name: &str, result: Value, can_retry: bool) -> Result<Task> {
        self.backend
            .atomic_fail(task_id, agent_name, result, can_retry, Utc::now())
            .await
    }

    pub async fn extend_lease(&self, task_id: &TaskId, agent_name: &str, additional_minutes: f64) -> Result<Task> {
        let additional = chrono::Duration::milliseconds((additional_minutes * 60_000.0) as i64);
        self.backend
            .atomic_extend_lease(task_id, agent_name, additional, Utc::now())
            .await
    }

    pub async fn list_active_agents(&self, project_id: &ProjectId) -> Result<Vec<String>> {
        let running = self
            .backend
            .list_tasks(
                project_id,
                TaskFilter {
                    status: Some(TaskStatus::Running),
                    ..Default::default()
                },
            )
            .await?;
        let mut agents: Vec<String> = running.into_iter().filter_map(|t| t.assigned_to).collect();
        agents.sort();
        agents.dedup();
        Ok(agents)
    }

    pub async fn get_agent_status(&self, agent_name: &str, project_id: &ProjectId) -> Result<Option<Task>> {
        let running = self
            .backend
            .list_tasks(
                project_id,
                TaskFilter {
                    status: Some(TaskStatus::Running),
                    assigned_to: Some(agent_name.to_string()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(running.into_iter().next())
    }

    pub async fn reap(&self, project_id: &ProjectId) -> Result<ReapOutcome> {
        self.backend.reap_sweep(project_id, Utc::now()).await
    }

    pub async fn stats(&self, project_id: &ProjectId) -> Result<ProjectStats> {
        let tasks = self.backend.list_tasks(project_id, TaskFilter::default()).await?;
        let mut stats = ProjectStats::default();
        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Queued => stats.queued += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    // ---- Sessions ----

    pub async fn create_session(
        &self,
        agent_name: impl Into<String>,
        project_id: ProjectId,
        resume_existing: bool,
        ttl: Option<chrono::Duration>,
    ) -> Result<Session> {
        let ttl = ttl.unwrap_or_else(|| self.config.session_default_ttl());
        let session = Session::new(agent_name, project_id, ttl, Utc::now());
        self.backend.create_session(session, resume_existing).await
    }

    pub async fn get_session(&self, token: &SessionToken) -> Result<Option<Session>> {
        self.backend.get_session(token, Utc::now()).await
    }

    pub async fn update_session(&self, token: &SessionToken, data: HashMap<String, Value>) -> Result<Session> {
        self.backend.update_session_data(token, data, Utc::now()).await
    }

    pub async fn delete_session(&self, token: &SessionToken) -> Result<()> {
        if !self.backend.delete_session(token).await? {
            return Err(BrokerError::not_found("session", token.to_string()));
        }
        Ok(())
    }

    pub async fn find_sessions_by_agent(&self, agent_name: &str, project_id: &ProjectId) -> Result<Vec<Session>> {
        self.backend.find_sessions_by_agent(agent_name, project_id).await
    }

    pub async fn cleanup_expired_sessions(&self) -> Result<usize> {
        self.backend.cleanup_expired_sessions(Utc::now()).await
    }

    async fn lease_duration_for_project(&self, project_id: &ProjectId) -> Result<chrono::Duration> {
        let project = self
            .backend
            .get_project(project_id)
            .await?
            .ok_or_else(|| BrokerError::not_found("project", project_id.to_string()))?;
        Ok(chrono::Duration::milliseconds(
            (project.default_lease_duration_minutes * 60_000.0) as i64,
        ))
    }
}

/// Server-generated agent name (§4.2): `agent-<timestamp>-<random>`.
fn generate_agent_name() -> String {
    format!("agent-{}-{:06x}", Utc::now().timestamp_millis(), rand::random::<u32>() & 0xffffff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;

    async fn broker() -> Broker<MemoryBackend> {
        Broker::new(Arc::new(MemoryBackend::new()), BrokerConfig::default())
    }

    #[tokio::test]
    async fn basic_lifecycle_scenario() {
        let broker = broker().await;
        let project = broker.create_project("P", None, None).await.unwrap();
        let task_type = broker
            .create_task_type(
                project.id.clone(),
                "greet",
                "hello {{who}}",
                vec!["who".to_string()],
                None,
                Some(0),
                Some(1.0),
            )
            .await
            .unwrap();
        let mut vars = HashMap::new();
        vars.insert("who".to_string(), "world".to_string());
        let task = broker
            .create_task(project.id.clone(), task_type.id.clone(), vars, Some(TaskId::from_str_unchecked("K")), None)
            .await
            .unwrap();

        let fetched = broker.fetch_next(&project.id, Some("a1".to_string())).await.unwrap();
        assert_eq!(fetched.task.as_ref().unwrap().id, task.id);
        assert_eq!(fetched.task.as_ref().unwrap().status, TaskStatus::Running);

        let completed = broker
            .complete(&task.id, "a1", serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);

        let second = broker.fetch_next(&project.id, Some("a2".to_string())).await.unwrap();
        assert!(second.task.is_none());
    }

    #[tokio::test]
    async fn retry_then_fail_scenario() {
        let broker = broker().await;
        let project = broker.create_project("P", None, None).await.unwrap();
        let task_type = broker
            .create_task_type(project.id.clone(), "t", "do it", vec![], None, Some(1), Some(1.0))
            .await
            .unwrap();
        let task = broker
            .create_task(project.id.clone(), task_type.id.clone(), HashMap::new(), None, None)
            .await
            .unwrap();

        let first = broker.fetch_next(&project.id, Some("a1".to_string())).await.unwrap();
        assert_eq!(first.task.unwrap().id, task.id);
        let after_first_fail = broker.fail(&task.id, "a1", serde_json::json!({}), true).await.unwrap();
        assert_eq!(after_first_fail.status, TaskStatus::Queued);
        assert_eq!(after_first_fail.retry_count, 1);

        let second = broker.fetch_next(&project.id, Some("a2".to_string())).await.unwrap();
        assert_eq!(second.task.unwrap().id, task.id);
        let after_second_fail = broker.fail(&task.id, "a2", serde_json::json!({}), true).await.unwrap();
        assert_eq!(after_second_fail.status, TaskStatus::Failed);
        assert_eq!(after_second_fail.retry_count, 2);

        let third = broker.fetch_next(&project.id, Some("a3".to_string())).await.unwrap();
        assert!(third.task.is_none());
    }

    #[tokio::test]
    async fn wrong_agent_completion_is_rejected() {
        let broker = broker().await;
        let project = broker.create_project("P", None, None).await.unwrap();
        let task_type = broker
            .create_task_type(project.id.clone(), "t", "x", vec![], None, Some(0), Some(1.0))
            .await
            .unwrap();
        let task = broker
            .create_task(project.id.clone(), task_type.id.clone(), HashMap::new(), None, None)
            .await
            .unwrap();
        broker.fetch_next(&project.id, Some("a1".to_string())).await.unwrap();
        let err = broker
            .complete(&task.id, "a2", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotAssignedToAgent { .. }));
    }

    #[tokio::test]
    async fn duplicate_ignore_policy_returns_same_task() {
        let broker = broker().await;
        let project = broker.create_project("P", None, None).await.unwrap();
        let task_type = broker
            .create_task_type(
                project.id.clone(),
                "t",
                "x",
                vec![],
                Some(DuplicatePolicy::Ignore),
                Some(0),
                Some(1.0),
            )
            .await
            .unwrap();
        let mut vars = HashMap::new();
        vars.insert("x".to_string(), "1".to_string());
        let first = broker
            .create_task(project.id.clone(), task_type.id.clone(), vars.clone(), None, None)
            .await
            .unwrap();
        let second = broker
            .create_task(project.id.clone(), task_type.id.clone(), vars, None, None)
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        let all = broker.list_tasks(&project.id, TaskFilter::default()).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn missing_template_variable_rejected_at_create() {
        let broker = broker().await;
        let project = broker.create_project("P", None, None).await.unwrap();
        let task_type = broker
            .create_task_type(project.id.clone(), "t", "hello {{who}}", vec!["who".to_string()], None, Some(0), Some(1.0))
            .await
            .unwrap();
        let err = broker
            .create_task(project.id.clone(), task_type.id.clone(), HashMap::new(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::MissingTemplateVariables { .. }));
    }

    #[tokio::test]
    async fn project_isolation_p7() {
        let broker = broker().await;
        let project_a = broker.create_project("A", None, None).await.unwrap();
        let project_b = broker.create_project("B", None, None).await.unwrap();
        let tt_a = broker
            .create_task_type(project_a.id.clone(), "t", "x", vec![], None, Some(0), Some(1.0))
            .await
            .unwrap();
        broker
            .create_task(project_a.id.clone(), tt_a.id.clone(), HashMap::new(), None, None)
            .await
            .unwrap();
        let fetched = broker.fetch_next(&project_b.id, Some("a1".to_string())).await.unwrap();
        assert!(fetched.task.is_none());
    }
}
