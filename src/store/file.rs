//! Single-node file backend (§4.1).
//!
//! One JSON container per project under `{root}/tasks/{project_id}.json`
//! holds that project's task types and tasks; `{root}/projects.json` holds
//! project metadata and backs the global name index; one-file-per-session
//! lives under `{root}/sessions/`. Every mutating operation acquires (a)
//! an in-process `parking_lot::Mutex` keyed by the file path and (b) an
//! `fs4` advisory lock on the file itself, bounded-retries with backoff,
//! and gives up with `LockTimeout` rather than blocking forever. Writes go
//! through write-temp + fsync + rename so a crash mid-write never leaves a
//! torn file.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::RetryBackoff;
use crate::domain::{Project, ProjectPatch, Session, Task, TaskPatch, TaskStatus, TaskType, TaskTypePatch};
use crate::error::{BrokerError, Result};
use crate::ids::{ProjectId, SessionToken, TaskId, TaskTypeId};

use super::{ReapOutcome, StorageBackend, TaskFilter};

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectIndex {
    projects: Vec<Project>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectTaskRecord {
    task_types: Vec<TaskType>,
    tasks: Vec<Task>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionStore {
    sessions: Vec<Session>,
}

/// Guards one path with an in-process mutex and an `fs4` advisory lock,
/// bounded by `timeout`/`backoff`. Drops both on scope exit.
struct FileGuard {
    _process_guard: parking_lot::ArcMutexGuard<parking_lot::RawMutex, ()>,
    file: File,
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct FileBackend {
    root: PathBuf,
    timeout: std::time::Duration,
    backoff: RetryBackoff,
    path_locks: dashmap::DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>, timeout_millis: u64, backoff: RetryBackoff) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("tasks"))?;
        fs::create_dir_all(root.join("sessions"))?;
        Ok(Self {
            root,
            timeout: std::time::Duration::from_millis(timeout_millis),
            backoff,
            path_locks: dashmap::DashMap::new(),
        })
    }

    fn projects_path(&self) -> PathBuf {
        self.root.join("projects.json")
    }

    fn task_record_path(&self, project_id: &ProjectId) -> PathBuf {
        self.root.join("tasks").join(format!("{project_id}.json"))
    }

    fn sessions_path(&self) -> PathBuf {
        self.root.join("sessions").join("sessions.json")
    }

    fn process_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquires the in-process and filesystem locks for `path`, retrying
    /// with backoff until `self.timeout` elapses.
    fn lock(&self, path: &Path) -> Result<FileGuard> {
        let lock_arc = self.process_lock(path);
        let process_guard = parking_lot::Mutex::lock_arc(&lock_arc);

        let file = OpenOptions::new().create(true).read(true).write(true).open(path)?;
        let start = Instant::now();
        let mut attempt = 0u32;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(FileGuard {
                        _process_guard: process_guard,
                        file,
                    })
                }
                Err(_) => {
                    if start.elapsed() >= self.timeout {
                        return Err(BrokerError::LockTimeout {
                            project_id: ProjectId::from_str_unchecked(path.to_string_lossy().to_string()),
                        });
                    }
                    std::thread::sleep(self.backoff.delay_for_attempt(attempt));
                    attempt += 1;
                }
            }
        }
    }

    fn read_json<T: Default + serde::de::DeserializeOwned>(&self, file: &File) -> Result<T> {
        use std::io::Seek;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(T::default());
        }
        let mut f = file.try_clone()?;
        f.seek(std::io::SeekFrom::Start(0))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(f))?)
    }

    /// write-temp + fsync + rename, then re-open the guard's file handle
    /// pointed at the new content so subsequent reads in the same
    /// critical section see it.
    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let bytes = serde_json::to_vec_pretty(value)?;
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&bytes)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn create_project(&self, project: Project) -> Result<Project> {
        let path = self.projects_path();
        let guard = self.lock(&path)?;
        let mut index: ProjectIndex = self.read_json(&guard.file)?;
        if index.projects.iter().any(|p| p.name == project.name) {
            return Err(BrokerError::already_exists("project", project.name.clone()));
        }
        index.projects.push(project.clone());
        self.write_json(&path, &index)?;
        drop(guard);
        self.write_json(&self.task_record_path(&project.id), &ProjectTaskRecord::default())?;
        Ok(project)
    }

    async fn get_project(&self, id: &ProjectId) -> Result<Option<Project>> {
        let path = self.projects_path();
        let guard = self.lock(&path)?;
        let index: ProjectIndex = self.read_json(&guard.file)?;
        Ok(index.projects.into_iter().find(|p| &p.id == id))
    }

    async fn get_project_by_name(&self, name: &str) -> Result<Option<Project>> {
        let path = self.projects_path();
        let guard = self.lock(&path)?;
        let index: ProjectIndex = self.read_json(&guard.file)?;
        Ok(index.projects.into_iter().find(|p| p.name == name))
    }

    async fn list_projects(&self, include_closed: bool) -> Result<Vec<Project>> {
        let path = self.projects_path();
        let guard = self.lock(&path)?;
        let index: ProjectIndex = self.read_json(&guard.file)?;
        Ok(index
            .projects
            .into_iter()
            .filter(|p| include_closed || p.status == crate::domain::ProjectStatus::Active)
            .collect())
    }

    async fn update_project(&self, id: &ProjectId, patch: ProjectPatch, now: DateTime<Utc>) -> Result<Project> {
        let path = self.projects_path();
        let guard = self.lock(&path)?;
        let mut index: ProjectIndex = self.read_json(&guard.file)?;
        let project = index
            .projects
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| BrokerError::not_found("project", id.to_string()))?;
        project.apply(patch, now);
        let updated = project.clone();
        self.write_json(&path, &index)?;
        Ok(updated)
    }

    async fn delete_project(&self, id: &ProjectId) -> Result<bool> {
        let path = self.projects_path();
        let guard = self.lock(&path)?;
        let mut index: ProjectIndex = self.read_json(&guard.file)?;
        let before = index.projects.len();
        index.projects.retain(|p| &p.id != id);
        let removed = index.projects.len() != before;
        if removed {
            self.write_json(&path, &index)?;
        }
        drop(guard);
        let _ = fs::remove_file(self.task_record_path(id));
        Ok(removed)
    }

    async fn create_task_type(&self, task_type: TaskType) -> Result<TaskType> {
        let path = self.task_record_path(&task_type.project_id);
        let guard = self.lock(&path)?;
        let mut record: ProjectTaskRecord = self.read_json(&guard.file)?;
        if record.task_types.iter().any(|tt| tt.name == task_type.name) {
            return Err(BrokerError::already_exists("task_type", task_type.name.clone()));
        }
        record.task_types.push(task_type.clone());
        self.write_json(&path, &record)?;
        Ok(task_type)
    }

    async fn get_task_type(&self, id: &TaskTypeId) -> Result<Option<TaskType>> {
        for record in self.all_task_records()? {
            if let Some(tt) = record.task_types.into_iter().find(|tt| &tt.id == id) {
                return Ok(Some(tt));
            }
        }
        Ok(None)
    }

    async fn get_task_type_by_name(&self, project_id: &ProjectId, name: &str) -> Result<Option<TaskType>> {
        let path = self.task_record_path(project_id);
        let guard = self.lock(&path)?;
        let record: ProjectTaskRecord = self.read_json(&guard.file)?;
        Ok(record.task_types.into_iter().find(|tt| tt.name == name))
    }

    async fn list_task_types(&self, project_id: &ProjectId) -> Result<Vec<TaskType>> {
        let path = self.task_record_path(project_id);
        let guard = self.lock(&path)?;
        let record: ProjectTaskRecord = self.read_json(&guard.file)?;
        Ok(record.task_types)
    }

    async fn update_task_type(&self, id: &TaskTypeId, patch: TaskTypePatch) -> Result<TaskType> {
        for path in self.all_task_record_paths()? {
            let guard = self.lock(&path)?;
            let mut record: ProjectTaskRecord = self.read_json(&guard.file)?;
            if let Some(tt) = record.task_types.iter_mut().find(|tt| &tt.id == id) {
                tt.apply(patch)?;
                let updated = tt.clone();
                self.write_json(&path, &record)?;
                return Ok(updated);
            }
        }
        Err(BrokerError::not_found("task_type", id.to_string()))
    }

    async fn delete_task_type(&self, id: &TaskTypeId) -> Result<bool> {
        for path in self.all_task_record_paths()? {
            let guard = self.lock(&path)?;
            let mut record: ProjectTaskRecord = self.read_json(&guard.file)?;
            let before = record.task_types.len();
            record.task_types.retain(|tt| &tt.id != id);
            if record.task_types.len() != before {
                self.write_json(&path, &record)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn insert_queued_task(&self, task: Task) -> Result<Task> {
        let path = self.task_record_path(&task.project_id);
        let guard = self.lock(&path)?;
        let mut record: ProjectTaskRecord = self.read_json(&guard.file)?;
        record.tasks.push(task.clone());
        self.write_json(&path, &record)?;
        Ok(task)
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>> {
        for record in self.all_task_records()? {
            if let Some(task) = record.tasks.into_iter().find(|t| &t.id == id) {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    async fn list_tasks(&self, project_id: &ProjectId, filter: TaskFilter) -> Result<Vec<Task>> {
        let path = self.task_record_path(project_id);
        let guard = self.lock(&path)?;
        let record: ProjectTaskRecord = self.read_json(&guard.file)?;
        let mut tasks: Vec<Task> = record
            .tasks
            .into_iter()
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
        for path in self.all_task_record_paths()? {
            let guard = self.lock(&path)?;
            let mut record: ProjectTaskRecord = self.read_json(&guard.file)?;
            if let Some(task) = record.tasks.iter_mut().find(|t| &t.id == id) {
                if let Some(description) = patch.description {
                    task.description = description;
                }
                if let Some(variables) = patch.variables {
                    task.variables = variables;
                }
                let updated = task.clone();
                self.write_json(&path, &record)?;
                return Ok(updated);
            }
        }
        Err(BrokerError::not_found("task", id.to_string()))
    }

    async fn delete_task(&self, id: &TaskId) -> Result<bool> {
        for path in self.all_task_record_paths()? {
            let guard = self.lock(&path)?;
            let mut record: ProjectTaskRecord = self.read_json(&guard.file)?;
            let before = record.tasks.len();
            record.tasks.retain(|t| &t.id != id);
            if record.tasks.len() != before {
                self.write_json(&path, &record)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn atomic_fetch_and_lease(
        &self,
        project_id: &ProjectId,
        agent_name: &str,
        now: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Result<Option<Task>> {
        let path = self.task_record_path(project_id);
        let guard = self.lock(&path)?;
        let mut record: ProjectTaskRecord = self.read_json(&guard.file)?;

        if let Some(task) = record.tasks.iter_mut().find(|t| {
            t.status == TaskStatus::Running
                && t.assigned_to.as_deref() == Some(agent_name)
                && t.lease_expires_at.map(|e| e > now).unwrap_or(false)
        }) {
            let resumed = task.clone();
            return Ok(Some(resumed));
        }

        let chosen_id = record
            .tasks
            .iter()
            .filter(|t| t.is_fetchable(now))
            .min_by_key(|t| t.created_at)
            .map(|t| t.id.clone());

        let Some(chosen_id) = chosen_id else {
            return Ok(None);
        };

        let task = record.tasks.iter_mut().find(|t| t.id == chosen_id).unwrap();
        task.lease_to(agent_name, now, lease_duration);
        let leased = task.clone();
        self.write_json(&path, &record)?;
        self.verify_write(&path, &leased.id, |t| t.status == TaskStatus::Running)?;
        Ok(Some(leased))
    }

    async fn atomic_complete(&self, task_id: &TaskId, agent_name: &str, result: Value, now: DateTime<Utc>) -> Result<Task> {
        self.mutate_task(task_id, |task| {
            ensure_assigned(task, agent_name)?;
            ensure_running(task)?;
            task.complete(result, now);
            Ok(())
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
        self.mutate_task(task_id, |task| {
            ensure_assigned(task, agent_name)?;
            ensure_running(task)?;
            task.fail(result, can_retry, now);
            Ok(())
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
        self.mutate_task(task_id, |task| {
            ensure_assigned(task, agent_name)?;
            ensure_running(task)?;
            task.extend_lease(additional);
            Ok(())
        })
        .await
    }

    async fn atomic_find_duplicate(
        &self,
        project_id: &ProjectId,
        type_id: &TaskTypeId,
        variables: &HashMap<String, String>,
    ) -> Result<Option<Task>> {
        let path = self.task_record_path(project_id);
        let guard = self.lock(&path)?;
        let record: ProjectTaskRecord = self.read_json(&guard.file)?;
        Ok(record
            .tasks
            .into_iter()
            .find(|t| &t.type_id == type_id && t.status != TaskStatus::Failed && t.variables_match(variables)))
    }

    async fn reap_sweep(&self, project_id: &ProjectId, now: DateTime<Utc>) -> Result<ReapOutcome> {
        let path = self.task_record_path(project_id);
        let guard = self.lock(&path)?;
        let mut record: ProjectTaskRecord = self.read_json(&guard.file)?;

        let mut reclaimed_tasks = 0usize;
        let mut agents_reclaimed = std::collections::HashSet::new();
        for task in record.tasks.iter_mut() {
            let expired = task.status == TaskStatus::Running && task.lease_expires_at.map(|e| e <= now).unwrap_or(false);
            if !expired {
                continue;
            }
            if let Some(agent) = task.assigned_to.clone() {
                agents_reclaimed.insert(agent);
            }
            task.reclaim_expired(now);
            reclaimed_tasks += 1;
        }
        let agents_with_remaining_running: std::collections::HashSet<String> = record
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .filter_map(|t| t.assigned_to.clone())
            .collect();
        let cleaned_agents = agents_reclaimed
            .into_iter()
            .filter(|a| !agents_with_remaining_running.contains(a))
            .count();

        self.write_json(&path, &record)?;
        Ok(ReapOutcome {
            reclaimed_tasks,
            cleaned_agents,
        })
    }

    async fn create_session(&self, session: Session, resume_existing: bool) -> Result<Session> {
        let path = self.sessions_path();
        let guard = self.lock(&path)?;
        let mut store: SessionStore = self.read_json(&guard.file)?;
        if resume_existing {
            if let Some(existing) = store
                .sessions
                .iter()
                .find(|s| s.agent_name == session.agent_name && s.project_id == session.project_id && !s.is_expired(session.created_at))
            {
                return Ok(existing.clone());
            }
        }
        store.sessions.push(session.clone());
        self.write_json(&path, &store)?;
        Ok(session)
    }

    async fn get_session(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<Session>> {
        let path = self.sessions_path();
        let guard = self.lock(&path)?;
        let mut store: SessionStore = self.read_json(&guard.file)?;
        let Some(pos) = store.sessions.iter().position(|s| &s.token == token) else {
            return Ok(None);
        };
        if store.sessions[pos].is_expired(now) {
            store.sessions.remove(pos);
            self.write_json(&path, &store)?;
            return Ok(None);
        }
        store.sessions[pos].touch(now);
        let updated = store.sessions[pos].clone();
        self.write_json(&path, &store)?;
        Ok(Some(updated))
    }

    async fn update_session_data(&self, token: &SessionToken, data: HashMap<String, Value>, now: DateTime<Utc>) -> Result<Session> {
        let path = self.sessions_path();
        let guard = self.lock(&path)?;
        let mut store: SessionStore = self.read_json(&guard.file)?;
        let session = store
            .sessions
            .iter_mut()
            .find(|s| &s.token == token)
            .ok_or_else(|| BrokerError::not_found("session", token.to_string()))?;
        session.data = data;
        session.touch(now);
        let updated = session.clone();
        self.write_json(&path, &store)?;
        Ok(updated)
    }

    async fn delete_session(&self, token: &SessionToken) -> Result<bool> {
        let path = self.sessions_path();
        let guard = self.lock(&path)?;
        let mut store: SessionStore = self.read_json(&guard.file)?;
        let before = store.sessions.len();
        store.sessions.retain(|s| &s.token != token);
        let removed = store.sessions.len() != before;
        if removed {
            self.write_json(&path, &store)?;
        }
        Ok(removed)
    }

    async fn find_sessions_by_agent(&self, agent_name: &str, project_id: &ProjectId) -> Result<Vec<Session>> {
        let path = self.sessions_path();
        let guard = self.lock(&path)?;
        let store: SessionStore = self.read_json(&guard.file)?;
        Ok(store
            .sessions
            .into_iter()
            .filter(|s| s.agent_name == agent_name && &s.project_id == project_id)
            .collect())
    }

    async fn cleanup_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        let path = self.sessions_path();
        let guard = self.lock(&path)?;
        let mut store: SessionStore = self.read_json(&guard.file)?;
        let before = store.sessions.len();
        store.sessions.retain(|s| !s.is_expired(now));
        let removed = before - store.sessions.len();
        if removed > 0 {
            self.write_json(&path, &store)?;
        }
        Ok(removed)
    }
}

impl FileBackend {
    fn all_task_record_paths(&self) -> Result<Vec<PathBuf>> {
        let dir = self.root.join("tasks");
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().extension().map(|e| e == "json").unwrap_or(false) {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }

    fn all_task_records(&self) -> Result<Vec<ProjectTaskRecord>> {
        let mut records = Vec::new();
        for path in self.all_task_record_paths()? {
            let guard = self.lock(&path)?;
            records.push(self.read_json(&guard.file)?);
        }
        Ok(records)
    }

    async fn mutate_task(&self, task_id: &TaskId, f: impl FnOnce(&mut Task) -> Result<()>) -> Result<Task> {
        for path in self.all_task_record_paths()? {
            let guard = self.lock(&path)?;
            let mut record: ProjectTaskRecord = self.read_json(&guard.file)?;
            if let Some(task) = record.tasks.iter_mut().find(|t| &t.id == task_id) {
                f(task)?;
                let updated = task.clone();
                self.write_json(&path, &record)?;
                return Ok(updated);
            }
        }
        Err(BrokerError::not_found("task", task_id.to_string()))
    }

    /// Re-reads the just-written file and checks `predicate` holds for the
    /// given task, per §4.1's "re-read and verify... before releasing."
    fn verify_write(&self, path: &Path, task_id: &TaskId, predicate: impl Fn(&Task) -> bool) -> Result<()> {
        let bytes = fs::read(path)?;
        let record: ProjectTaskRecord = serde_json::from_slice(&bytes)?;
        let task = record
            .tasks
            .iter()
            .find(|t| &t.id == task_id)
            .ok_or_else(|| BrokerError::StorageUnavailable {
                reason: "task missing from post-write verification read".to_string(),
            })?;
        if !predicate(task) {
            return Err(BrokerError::StorageUnavailable {
                reason: "post-write verification failed".to_string(),
            });
        }
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (FileBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path(), 2_000, RetryBackoff::default()).unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn create_and_get_project_round_trips() {
        let (backend, _dir) = backend();
        let project = Project::new("demo", None, None, &crate::config::BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let fetched = backend.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "demo");
    }

    #[tokio::test]
    async fn create_project_rejects_duplicate_name() {
        let (backend, _dir) = backend();
        let project = Project::new("demo", None, None, &crate::config::BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let dup = Project::new("demo", None, None, &crate::config::BrokerConfig::default(), Utc::now());
        let err = backend.create_project(dup).await.unwrap_err();
        assert!(matches!(err, BrokerError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn fetch_and_lease_persists_across_reopen() {
        let (backend, dir) = backend();
        let project = Project::new("demo", None, None, &crate::config::BrokerConfig::default(), Utc::now());
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
        backend
            .atomic_fetch_and_lease(&project.id, "a1", Utc::now(), Duration::minutes(5))
            .await
            .unwrap();

        let reopened = FileBackend::new(dir.path(), 2_000, RetryBackoff::default()).unwrap();
        let reread = reopened.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(reread.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn concurrent_fetch_and_lease_never_double_assigns() {
        use std::sync::Arc as StdArc;
        let dir = tempfile::tempdir().unwrap();
        let backend = StdArc::new(FileBackend::new(dir.path(), 5_000, RetryBackoff::default()).unwrap());
        let project = Project::new("demo", None, None, &crate::config::BrokerConfig::default(), Utc::now());
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
        backend.insert_queued_task(task).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let backend = backend.clone();
            let project_id = project.id.clone();
            handles.push(tokio::spawn(async move {
                backend
                    .atomic_fetch_and_lease(&project_id, &format!("agent-{i}"), Utc::now(), Duration::minutes(5))
                    .await
                    .unwrap()
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }
}
