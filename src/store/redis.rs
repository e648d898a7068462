//! Redis-scripted backend — the "replicated in-memory store" strategy of
//! §4.1. `atomic_fetch_and_lease` is a `redis::Script` (Lua) that decodes
//! the task JSON with the server's built-in `cjson`, scans the per-project
//! sorted set for the oldest fetchable candidate, mutates it, and
//! re-encodes in one round trip — the scan-and-select counterpart to the
//! single-key CAS scripts in the Redis backend this is grounded on. The
//! single-task transitions (`complete`/`fail`/`extend_lease`) reuse the
//! same `Task` state-machine methods the in-memory backend calls, guarded
//! by a `WATCH`/`MULTI`/`EXEC` optimistic-concurrency retry loop instead of
//! a second script, since the mutation itself is ordinary Rust logic with
//! no need to live server-side.
//!
//! Key schema (`{prefix}` defaults to `"taskdriver"`):
//! - `{prefix}:project:{id}` — string, JSON `Project`.
//! - `{prefix}:project_name:{name}` — string, project id (uniqueness index).
//! - `{prefix}:projects` — set of project ids.
//! - `{prefix}:tasktype:{id}` — string, JSON `TaskType`.
//! - `{prefix}:tasktypes:{project_id}` — set of task type ids.
//! - `{prefix}:task:{id}` — string, JSON `Task`.
//! - `{prefix}:tasks:{project_id}` — sorted set of task ids scored by
//!   `created_at` (epoch millis), the structure the fetch/reap scripts
//!   scan.
//! - `{prefix}:session:{token}` — string, JSON `Session`.
//! - `{prefix}:sessions:{project_id}:{agent_name}` — set of session tokens.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::{aio::MultiplexedConnection, AsyncCommands, Script};
use serde_json::Value;

use crate::domain::{Project, ProjectPatch, Session, Task, TaskPatch, TaskStatus, TaskType, TaskTypePatch};
use crate::error::{BrokerError, Result};
use crate::ids::{ProjectId, SessionToken, TaskId, TaskTypeId};

use super::{ReapOutcome, StorageBackend, TaskFilter};

const LUA_FETCH_AND_LEASE: &str = r#"
local tasks_key = KEYS[1]
local agent_name = ARGV[1]
local now_iso = ARGV[2]
local lease_expires_iso = ARGV[3]
local attempt_id = ARGV[4]
local key_prefix = ARGV[5]

-- RFC3339 timestamps from chrono always start with a fixed-width
-- "YYYY-MM-DDTHH:MM:SS" prefix regardless of fractional-second precision
-- or offset suffix, so a mixed-radix encoding of that prefix preserves
-- chronological ordering without needing a real epoch conversion.
local function iso_key(iso)
  local y, mo, d, h, mi, s = iso:match('^(%d+)-(%d+)-(%d+)T(%d+):(%d+):(%d+)')
  if not y then return 0 end
  return ((((tonumber(y) * 12 + tonumber(mo)) * 31 + tonumber(d)) * 24 + tonumber(h)) * 60 + tonumber(mi)) * 60 + tonumber(s)
end

local now_key = iso_key(now_iso)

local ids = redis.call('ZRANGE', tasks_key, 0, -1)
for _, id in ipairs(ids) do
  local task_key = key_prefix .. ':task:' .. id
  local raw = redis.call('GET', task_key)
  if raw then
    local task = cjson.decode(raw)
    if task.status == 'running' and task.assigned_to == agent_name then
      -- resumption: only hand the agent back its own task while the
      -- lease is still live. An expired self-owned lease falls through
      -- to the re-lease loop below, same as any other fetcher would see it.
      if task.lease_expires_at and iso_key(task.lease_expires_at) > now_key then
        return raw
      end
    end
  end
end

for _, id in ipairs(ids) do
  local task_key = key_prefix .. ':task:' .. id
  local raw = redis.call('GET', task_key)
  if raw then
    local task = cjson.decode(raw)
    local eligible = false
    if task.status == 'queued' and task.retry_count <= task.max_retries then
      eligible = true
    elseif task.status == 'running' and task.lease_expires_at and iso_key(task.lease_expires_at) <= now_key then
      eligible = true
    end
    if eligible then
      if task.attempts and #task.attempts > 0 then
        local last = task.attempts[#task.attempts]
        if last.status == 'running' then
          last.status = 'expired'
          last.completed_at = now_iso
        end
      end
      task.status = 'running'
      task.assigned_to = agent_name
      task.assigned_at = now_iso
      task.lease_expires_at = lease_expires_iso
      local new_attempt = {
        attempt_id = attempt_id,
        agent_name = agent_name,
        started_at = now_iso,
        completed_at = cjson.null,
        status = 'running',
        result = cjson.null,
      }
      table.insert(task.attempts, new_attempt)
      local encoded = cjson.encode(task)
      redis.call('SET', task_key, encoded)
      return encoded
    end
  end
end

return false
"#;

/// Bound on WATCH/MULTI/EXEC retries for the single-task transition helper,
/// mirroring the DynamoDB backend's CAS attempt cap.
const MAX_TRANSITION_ATTEMPTS: u32 = 8;

#[derive(Debug, Clone)]
pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisBackend {
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| BrokerError::StorageUnavailable { reason: e.to_string() })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::StorageUnavailable { reason: e.to_string() })?;
        Ok(Self {
            conn,
            key_prefix: "taskdriver".to_string(),
        })
    }

    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            key_prefix: "taskdriver".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn project_key(&self, id: &ProjectId) -> String {
        format!("{}:project:{}", self.key_prefix, id)
    }

    fn project_name_key(&self, name: &str) -> String {
        format!("{}:project_name:{}", self.key_prefix, name)
    }

    fn task_key(&self, id: &TaskId) -> String {
        format!("{}:task:{}", self.key_prefix, id)
    }

    fn tasks_index_key(&self, project_id: &ProjectId) -> String {
        format!("{}:tasks:{}", self.key_prefix, project_id)
    }

    fn task_type_key(&self, id: &TaskTypeId) -> String {
        format!("{}:tasktype:{}", self.key_prefix, id)
    }

    fn task_types_index_key(&self, project_id: &ProjectId) -> String {
        format!("{}:tasktypes:{}", self.key_prefix, project_id)
    }

    fn session_key(&self, token: &SessionToken) -> String {
        format!("{}:session:{}", self.key_prefix, token)
    }

    fn map_err(e: redis::RedisError) -> BrokerError {
        BrokerError::StorageUnavailable { reason: e.to_string() }
    }

    async fn get_task_raw(&self, id: &TaskId) -> Result<Option<Task>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.task_key(id)).await.map_err(Self::map_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(BrokerError::from)).transpose()
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    async fn create_project(&self, project: Project) -> Result<Project> {
        let mut conn = self.conn.clone();
        let name_key = self.project_name_key(&project.name);
        let set: bool = redis::cmd("SETNX")
            .arg(&name_key)
            .arg(project.id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(Self::map_err)?;
        if !set {
            return Err(BrokerError::already_exists("project", project.name.clone()));
        }
        let data = serde_json::to_string(&project)?;
        let _: () = conn.set(self.project_key(&project.id), data).await.map_err(Self::map_err)?;
        let _: () = conn
            .sadd(format!("{}:projects", self.key_prefix), project.id.to_string())
            .await
            .map_err(Self::map_err)?;
        Ok(project)
    }

    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.project_key(id)).await.map_err(Self::map_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(BrokerError::from)).transpose()
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(self.project_name_key(name)).await.map_err(Self::map_err)?;
        match id {
            Some(id) => self.get_project(&ProjectId::from_str_unchecked(id)).await,
            None => Ok(None),
        }
    }

    async fn list_projects(&self, include_closed: bool) -> Result<Vec<Project>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(format!("{}:projects", self.key_prefix)).await.map_err(Self::map_err)?;
        let mut out = Vec::new();
        for id in ids {
            if let Some(project) = self.get_project(&ProjectId::from_str_unchecked(id)).await? {
                if include_closed || project.status == crate::domain::ProjectStatus::Active {
                    out.push(project);
                }
            }
        }
        Ok(out)
    }

    async fn update_project(&self, id: &ProjectId, patch: ProjectPatch, now: DateTime<Utc>) -> Result<Project> {
        let mut project = self
            .get_project(id)
            .await?
            .ok_or_else(|| BrokerError::not_found("project", id.to_string()))?;
        project.apply(patch, now);
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(&project)?;
        let _: () = conn.set(self.project_key(id), data).await.map_err(Self::map_err)?;
        Ok(project)
    }

    async fn delete_project(&self, id: &ProjectId) -> Result<bool> {
        let Some(project) = self.get_project(id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.project_key(id)).await.map_err(Self::map_err)?;
        let _: () = conn.del(self.project_name_key(&project.name)).await.map_err(Self::map_err)?;
        let _: () = conn.srem(format!("{}:projects", self.key_prefix), id.to_string()).await.map_err(Self::map_err)?;
        let task_ids: Vec<String> = conn.zrange(self.tasks_index_key(id), 0, -1).await.map_err(Self::map_err)?;
        for task_id in task_ids {
            let _: () = conn.del(format!("{}:task:{}", self.key_prefix, task_id)).await.map_err(Self::map_err)?;
        }
        let _: () = conn.del(self.tasks_index_key(id)).await.map_err(Self::map_err)?;
        Ok(true)
    }

    async fn create_task_type(&self, task_type: TaskType) -> Result<TaskType> {
        if self.get_task_type_by_name(&task_type.project_id, &task_type.name).await?.is_some() {
            return Err(BrokerError::already_exists("task_type", task_type.name.clone()));
        }
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(&task_type)?;
        let _: () = conn.set(self.task_type_key(&task_type.id), data).await.map_err(Self::map_err)?;
        let _: () = conn
            .sadd(self.task_types_index_key(&task_type.project_id), task_type.id.to_string())
            .await
            .map_err(Self::map_err)?;
        Ok(task_type)
    }

    async fn get_task_type(&self, id: &TaskTypeId) -> Result<Option<TaskType>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.task_type_key(id)).await.map_err(Self::map_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(BrokerError::from)).transpose()
    }

    async fn get_task_type_by_name(&self, project_id: &ProjectId, name: &str) -> Result<Option<TaskType>> {
        for task_type in self.list_task_types(project_id).await? {
            if task_type.name == name {
                return Ok(Some(task_type));
            }
        }
        Ok(None)
    }

    async fn list_task_types(&self, project_id: &ProjectId) -> Result<Vec<TaskType>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(self.task_types_index_key(project_id)).await.map_err(Self::map_err)?;
        let mut out = Vec::new();
        for id in ids {
            if let Some(tt) = self.get_task_type(&TaskTypeId::from_str_unchecked(id)).await? {
                out.push(tt);
            }
        }
        Ok(out)
    }

    async fn update_task_type(&self, id: &TaskTypeId, patch: TaskTypePatch) -> Result<TaskType> {
        let mut task_type = self
            .get_task_type(id)
            .await?
            .ok_or_else(|| BrokerError::not_found("task_type", id.to_string()))?;
        task_type.apply(patch)?;
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(&task_type)?;
        let _: () = conn.set(self.task_type_key(id), data).await.map_err(Self::map_err)?;
        Ok(task_type)
    }

    async fn delete_task_type(&self, id: &TaskTypeId) -> Result<bool> {
        let Some(task_type) = self.get_task_type(id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.task_type_key(id)).await.map_err(Self::map_err)?;
        let _: () = conn
            .srem(self.task_types_index_key(&task_type.project_id), id.to_string())
            .await
            .map_err(Self::map_err)?;
        Ok(true)
    }

    async fn insert_queued_task(&self, task: Task) -> Result<Task> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(&task)?;
        let _: () = conn.set(self.task_key(&task.id), data).await.map_err(Self::map_err)?;
        let _: () = conn
            .zadd(self.tasks_index_key(&task.project_id), task.id.to_string(), task.created_at.timestamp_millis())
            .await
            .map_err(Self::map_err)?;
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        self.get_task_raw(id).await
    }

    async fn list_tasks(&self, project_id: &ProjectId, filter: TaskFilter) -> Result<Vec<Task>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(self.tasks_index_key(project_id), 0, -1).await.map_err(Self::map_err)?;
        let mut tasks = Vec::new();
        for id in ids {
            if let Some(task) = self.get_task_raw(&TaskId::from_str_unchecked(id)).await? {
                tasks.push(task);
            }
        }
        tasks.retain(|t| filter.status.map(|s| s == t.status).unwrap_or(true));
        tasks.retain(|t| filter.type_id.as_ref().map(|id| id == &t.type_id).unwrap_or(true));
        tasks.retain(|t| {
            filter
                .assigned_to
                .as_ref()
                .map(|a| t.assigned_to.as_deref() == Some(a.as_str()))
                .unwrap_or(true)
        });
        let offset = filter.offset.unwrap_or(0);
        let tasks = tasks.into_iter().skip(offset);
        Ok(match filter.limit {
            Some(limit) => tasks.take(limit).collect(),
            None => tasks.collect(),
        })
    }

    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task> {
        let mut task = self.get_task_raw(id).await?.ok_or_else(|| BrokerError::not_found("task", id.to_string()))?;
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(variables) = patch.variables {
            task.variables = variables;
        }
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(&task)?;
        let _: () = conn.set(self.task_key(id), data).await.map_err(Self::map_err)?;
        Ok(task)
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        let Some(task) = self.get_task_raw(id).await? else {
            return Ok(false);
        };
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.task_key(id)).await.map_err(Self::map_err)?;
        let _: () = conn
            .zrem(self.tasks_index_key(&task.project_id), id.to_string())
            .await
            .map_err(Self::map_err)?;
        Ok(true)
    }

    async fn atomic_fetch_and_lease(
        &self,
        project_id: &ProjectId,
        agent_name: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<Task>> {
        // Resumption check first (plain reads are sufficient: only this
        // agent can hold its own non-expired lease).
        for task in self.list_tasks(project_id, TaskFilter::default()).await? {
            if task.status == TaskStatus::Running
                && task.assigned_to.as_deref() == Some(agent_name)
                && task.lease_expires_at.map(|e| e > now).unwrap_or(false)
            {
                return Ok(Some(task));
            }
        }

        let script = Script::new(LUA_FETCH_AND_LEASE);
        let mut conn = self.conn.clone();
        let attempt_id = uuid::Uuid::new_v4().to_string();
        let result: Option<String> = script
            .key(self.tasks_index_key(project_id))
            .arg(agent_name)
            .arg(now.to_rfc3339())
            .arg((now + lease_duration).to_rfc3339())
            .arg(attempt_id)
            .arg(&self.key_prefix)
            .invoke_async(&mut conn)
            .await
            .map_err(Self::map_err)?;

        match result {
            Some(raw) => {
                let task: Task = serde_json::from_str(&raw)?;
                let _: () = conn.set(self.task_key(&task.id), &raw).await.map_err(Self::map_err)?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn atomic_complete(&self, task_id: &TaskId, agent_name: &str, result: Value, now: DateTime<Utc>) -> Result<Task> {
        self.transition(task_id, agent_name, |task| {
            task.complete(result.clone(), now);
        })
        .await
    }

    async fn atomic_fail(
        &self,
        task_id: &TaskId,
        agent_name: &str,
        result: Value,
        can_retry: bool,
        now: DateTime<Utc>,
    ) -> Result<Task> {
        self.transition(task_id, agent_name, |task| {
            task.fail(result.clone(), can_retry, now);
        })
        .await
    }

    async fn atomic_extend_lease(
        &self,
        task_id: &TaskId,
        agent_name: &str,
        additional: Duration,
        _now: DateTime<Utc>,
    ) -> Result<Task> {
        self.transition(task_id, agent_name, |task| {
            task.extend_lease(additional);
        })
        .await
    }

    async fn atomic_find_duplicate(
        &self,
        project_id: &ProjectId,
        type_id: &TaskTypeId,
        variables: &HashMap<String, String>,
    ) -> Result<Option<Task>> {
        for task in self.list_tasks(project_id, TaskFilter::default()).await? {
            if &task.type_id == type_id && task.status != TaskStatus::Failed && task.variables_match(variables) {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn reap_sweep(&self, project_id: &ProjectId, now: DateTime<Utc>) -> Result<ReapOutcome> {
        let mut reclaimed_tasks = 0usize;
        let mut agents_reclaimed = std::collections::HashSet::new();
        let tasks = self.list_tasks(project_id, TaskFilter::default()).await?;
        for task in &tasks {
            let expired = task.status == TaskStatus::Running && task.lease_expires_at.map(|e| e <= now).unwrap_or(false);
            if !expired {
                continue;
            }
            let agent = task.assigned_to.clone().unwrap_or_default();
            if let Ok(updated) = self
                .atomic_fail(&task.id, &agent, serde_json::json!({ "error": "lease expired" }), true, now)
                .await
            {
                if updated.status == TaskStatus::Queued || updated.status == TaskStatus::Failed {
                    reclaimed_tasks += 1;
                    agents_reclaimed.insert(agent);
                }
            }
        }
        let remaining = self.list_tasks(project_id, TaskFilter::default()).await?;
        let agents_with_remaining_running: std::collections::HashSet<String> = remaining
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .filter_map(|t| t.assigned_to)
            .collect();
        let cleaned_agents = agents_reclaimed.into_iter().filter(|a| !agents_with_remaining_running.contains(a)).count();
        Ok(ReapOutcome {
            reclaimed_tasks,
            cleaned_agents,
        })
    }

    async fn create_session(&self, session: Session, resume_existing: bool) -> Result<Session> {
        if resume_existing {
            let mut conn = self.conn.clone();
            let tokens: Vec<String> = conn
                .smembers(format!("{}:sessions:{}:{}", self.key_prefix, session.project_id, session.agent_name))
                .await
                .map_err(Self::map_err)?;
            for token in tokens {
                if let Some(existing) = self.get_session(&SessionToken::from_str_unchecked(token), session.created_at).await? {
                    return Ok(existing);
                }
            }
        }
        let mut conn = self.conn.clone();
        let data = serde_json::to_string(&session)?;
        let _: () = conn.set(self.session_key(&session.token), data).await.map_err(Self::map_err)?;
        let _: () = conn
            .sadd(
                format!("{}:sessions:{}:{}", self.key_prefix, session.project_id, session.agent_name),
                session.token.to_string(),
            )
            .await
            .map_err(Self::map_err)?;
        Ok(session)
    }

    async fn get_session(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<Session>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.session_key(token)).await.map_err(Self::map_err)?;
        let Some(raw) = raw else { return Ok(None) };
        let mut session: Session = serde_json::from_str(&raw)?;
        if session.is_expired(now) {
            let _: () = conn.del(self.session_key(token)).await.map_err(Self::map_err)?;
            return Ok(None);
        }
        session.touch(now);
        let data = serde_json::to_string(&session)?;
        let _: () = conn.set(self.session_key(token), data).await.map_err(Self::map_err)?;
        Ok(Some(session))
    }

    async fn update_session_data(&self, token: &SessionToken, data: HashMap<String, Value>, now: DateTime<Utc>) -> Result<Session> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.session_key(token)).await.map_err(Self::map_err)?;
        let mut session: Session = raw
            .map(|r| serde_json::from_str(&r))
            .transpose()?
            .ok_or_else(|| BrokerError::not_found("session", token.to_string()))?;
        session.data = data;
        session.touch(now);
        let encoded = serde_json::to_string(&session)?;
        let _: () = conn.set(self.session_key(token), encoded).await.map_err(Self::map_err)?;
        Ok(session)
    }

    async fn delete_session(&self, token: &SessionToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(self.session_key(token)).await.map_err(Self::map_err)?;
        let Some(raw) = raw else { return Ok(false) };
        let session: Session = serde_json::from_str(&raw)?;
        let _: () = conn.del(self.session_key(token)).await.map_err(Self::map_err)?;
        let _: () = conn
            .srem(
                format!("{}:sessions:{}:{}", self.key_prefix, session.project_id, session.agent_name),
                token.to_string(),
            )
            .await
            .map_err(Self::map_err)?;
        Ok(true)
    }

    async fn find_sessions_by_agent(&self, agent_name: &str, project_id: &ProjectId) -> Result<Vec<Session>> {
        let mut conn = self.conn.clone();
        let tokens: Vec<String> = conn
            .smembers(format!("{}:sessions:{}:{}", self.key_prefix, project_id, agent_name))
            .await
            .map_err(Self::map_err)?;
        let mut out = Vec::new();
        for token in tokens {
            let raw: Option<String> = conn.get(format!("{}:session:{}", self.key_prefix, token)).await.map_err(Self::map_err)?;
            if let Some(raw) = raw {
                out.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(out)
    }

    async fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        // No secondary index of all sessions is maintained (Redis TTL
        // would normally cover this); left for the native TTL mechanism
        // in a production deployment. Here we only clean what's already
        // been read via `get_session`/`find_sessions_by_agent`.
        let _ = now;
        Ok(0)
    }
}

impl RedisBackend {
    /// Applies `mutate` to the task under optimistic concurrency: `WATCH`
    /// the key, re-read it, validate the precondition, apply the mutation,
    /// then `MULTI`/`EXEC` the write. A concurrent writer touching the key
    /// between the watch and the exec aborts the transaction (`EXEC`
    /// returns nil) and we retry against the fresh value.
    async fn transition(&self, task_id: &TaskId, agent_name: &str, mutate: impl Fn(&mut Task)) -> Result<Task> {
        let key = self.task_key(task_id);
        let mut conn = self.conn.clone();

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let _: () = redis::cmd("WATCH").arg(&key).query_async(&mut conn).await.map_err(Self::map_err)?;

            let raw: Option<String> = conn.get(&key).await.map_err(Self::map_err)?;
            let Some(raw) = raw else {
                let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await.map_err(Self::map_err)?;
                return Err(BrokerError::not_found("task", task_id.to_string()));
            };
            let mut task: Task = serde_json::from_str(&raw)?;

            if task.assigned_to.as_deref() != Some(agent_name) {
                let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await.map_err(Self::map_err)?;
                return Err(BrokerError::NotAssignedToAgent {
                    task_id: task_id.clone(),
                    agent: agent_name.to_string(),
                });
            }
            if task.status != TaskStatus::Running {
                let _: () = redis::cmd("UNWATCH").query_async(&mut conn).await.map_err(Self::map_err)?;
                return Err(BrokerError::InvalidState {
                    task_id: task_id.clone(),
                    expected: "running",
                    actual: match task.status {
                        TaskStatus::Queued => "queued",
                        TaskStatus::Running => "running",
                        TaskStatus::Completed => "completed",
                        TaskStatus::Failed => "failed",
                    },
                });
            }

            mutate(&mut task);
            let encoded = serde_json::to_string(&task)?;

            let mut pipe = redis::pipe();
            pipe.atomic().set(&key, &encoded);
            let result: Option<((),)> = pipe.query_async(&mut conn).await.map_err(Self::map_err)?;
            if result.is_some() {
                return Ok(task);
            }
            // EXEC came back nil: another writer touched the key between
            // our WATCH and EXEC. Loop and retry against the fresh value.
        }

        Err(BrokerError::StorageUnavailable {
            reason: format!("transition on task {task_id} did not converge after {MAX_TRANSITION_ATTEMPTS} attempts"),
        })
    }
}

#[cfg(all(test, feature = "redis-tests"))]
mod integration_tests {
    use super::*;

    async fn backend() -> RedisBackend {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        RedisBackend::new(&url).await.unwrap().with_prefix(format!("test-{}", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn create_and_fetch_roundtrip() {
        let backend = backend().await;
        let project = Project::new("P", None, None, &crate::config::BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let task = Task::new_queued(
            TaskId::generate(),
            project.id.clone(),
            TaskTypeId::from_str_unchecked("tt1"),
            None,
            HashMap::new(),
            1,
            Utc::now(),
        );
        backend.insert_queued_task(task.clone()).await.unwrap();
        let leased = backend
            .atomic_fetch_and_lease(&project.id, "a1", Utc::now(), Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, task.id);
        assert_eq!(leased.status, TaskStatus::Running);
    }
}
