//! The same behavioral contract exercised against every always-available
//! backend (§4.1: "All three must pass the same property-based contract
//! test"). Each `#[tokio::test]` takes a backend constructor closure so the
//! assertions run twice, once per backend, without duplicating the bodies.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use taskdriver::{BrokerConfig, DuplicatePolicy, ProjectPatch, StorageBackend, Task, TaskId, TaskStatus, TaskType, TaskTypeId};

use taskdriver::store::file::FileBackend;
use taskdriver::store::memory::MemoryBackend;

async fn with_backends<F, Fut>(run: F)
where
    F: Fn(Arc<dyn StorageBackendDyn>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    run(Arc::new(MemoryBackend::new())).await;
    let dir = tempfile::tempdir().unwrap();
    run(Arc::new(FileBackend::new(dir.path().to_path_buf(), 2_000, Default::default()).unwrap())).await;
}

// A thin marker alias so the closure above can hold either concrete backend
// behind one trait object without losing access to `StorageBackend`.
trait StorageBackendDyn: StorageBackend {}
impl<T: StorageBackend> StorageBackendDyn for T {}

fn task_type(project_id: taskdriver::ProjectId, max_retries: u32) -> TaskType {
    TaskType::new(project_id, "t", "do {{thing}}", vec!["thing".to_string()], max_retries, 10.0, DuplicatePolicy::Allow).unwrap()
}

fn task(project_id: taskdriver::ProjectId, type_id: TaskTypeId, max_retries: u32) -> Task {
    let mut vars = HashMap::new();
    vars.insert("thing".to_string(), "work".to_string());
    Task::new_queued(TaskId::generate(), project_id, type_id, None, vars, max_retries, Utc::now())
}

#[tokio::test]
async fn create_project_enforces_unique_name() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("dup", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let second = taskdriver::Project::new("dup", None, None, &BrokerConfig::default(), Utc::now());
        let err = backend.create_project(second).await.unwrap_err();
        assert!(matches!(err, taskdriver::BrokerError::AlreadyExists { .. }));
    })
    .await;
}

#[tokio::test]
async fn fetch_and_lease_sets_i1_fields_and_excludes_from_next_fetch() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let tt = task_type(project.id.clone(), 1);
        backend.create_task_type(tt.clone()).await.unwrap();
        let t = task(project.id.clone(), tt.id.clone(), 1);
        backend.insert_queued_task(t.clone()).await.unwrap();

        let leased = backend
            .atomic_fetch_and_lease(&project.id, "a1", Utc::now(), Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.status, TaskStatus::Running);
        assert_eq!(leased.assigned_to.as_deref(), Some("a1"));
        assert!(leased.assigned_at.is_some());
        assert!(leased.lease_expires_at.is_some());

        let none_left = backend.atomic_fetch_and_lease(&project.id, "a2", Utc::now(), Duration::minutes(5)).await.unwrap();
        assert!(none_left.is_none());
    })
    .await;
}

#[tokio::test]
async fn completing_clears_i2_fields() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let tt = task_type(project.id.clone(), 1);
        backend.create_task_type(tt.clone()).await.unwrap();
        let t = task(project.id.clone(), tt.id.clone(), 1);
        backend.insert_queued_task(t.clone()).await.unwrap();
        backend.atomic_fetch_and_lease(&project.id, "a1", Utc::now(), Duration::minutes(5)).await.unwrap();

        let completed = backend.atomic_complete(&t.id, "a1", serde_json::json!({"ok": true}), Utc::now()).await.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(completed.assigned_to.is_none());
        assert!(completed.lease_expires_at.is_none());
    })
    .await;
}

#[tokio::test]
async fn completion_by_wrong_agent_is_rejected() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let tt = task_type(project.id.clone(), 1);
        backend.create_task_type(tt.clone()).await.unwrap();
        let t = task(project.id.clone(), tt.id.clone(), 1);
        backend.insert_queued_task(t.clone()).await.unwrap();
        backend.atomic_fetch_and_lease(&project.id, "a1", Utc::now(), Duration::minutes(5)).await.unwrap();

        let err = backend.atomic_complete(&t.id, "a2", serde_json::json!({}), Utc::now()).await.unwrap_err();
        assert!(matches!(err, taskdriver::BrokerError::NotAssignedToAgent { .. }));
    })
    .await;
}

#[tokio::test]
async fn reap_sweep_reclaims_lease_expired_tasks_i3() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let tt = task_type(project.id.clone(), 2);
        backend.create_task_type(tt.clone()).await.unwrap();
        let t = task(project.id.clone(), tt.id.clone(), 2);
        backend.insert_queued_task(t.clone()).await.unwrap();

        let past = Utc::now() - Duration::minutes(30);
        backend.atomic_fetch_and_lease(&project.id, "a1", past, Duration::minutes(1)).await.unwrap();

        let outcome = backend.reap_sweep(&project.id, Utc::now()).await.unwrap();
        assert_eq!(outcome.reclaimed_tasks, 1);
        assert_eq!(outcome.cleaned_agents, 1);

        let reclaimed = backend.get_task(&t.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Queued);
        assert_eq!(reclaimed.retry_count, 1);
    })
    .await;
}

#[tokio::test]
async fn duplicate_find_matches_on_type_and_variables() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let tt = task_type(project.id.clone(), 1);
        backend.create_task_type(tt.clone()).await.unwrap();
        let t = task(project.id.clone(), tt.id.clone(), 1);
        backend.insert_queued_task(t.clone()).await.unwrap();

        let mut same_vars = HashMap::new();
        same_vars.insert("thing".to_string(), "work".to_string());
        let found = backend.atomic_find_duplicate(&project.id, &tt.id, &same_vars).await.unwrap();
        assert_eq!(found.unwrap().id, t.id);

        let mut other_vars = HashMap::new();
        other_vars.insert("thing".to_string(), "other".to_string());
        let not_found = backend.atomic_find_duplicate(&project.id, &tt.id, &other_vars).await.unwrap();
        assert!(not_found.is_none());
    })
    .await;
}

#[tokio::test]
async fn duplicate_ignored_once_task_has_failed_terminally() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let tt = task_type(project.id.clone(), 0);
        backend.create_task_type(tt.clone()).await.unwrap();
        let t = task(project.id.clone(), tt.id.clone(), 0);
        backend.insert_queued_task(t.clone()).await.unwrap();
        backend.atomic_fetch_and_lease(&project.id, "a1", Utc::now(), Duration::minutes(5)).await.unwrap();
        backend.atomic_fail(&t.id, "a1", serde_json::json!({"error": "boom"}), true, Utc::now()).await.unwrap();

        let mut vars = HashMap::new();
        vars.insert("thing".to_string(), "work".to_string());
        let found = backend.atomic_find_duplicate(&project.id, &tt.id, &vars).await.unwrap();
        assert!(found.is_none(), "a terminally failed task must not count as a live duplicate");
    })
    .await;
}

#[tokio::test]
async fn session_resume_existing_returns_same_session_for_active_lease() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();

        let first = backend
            .create_session(taskdriver::Session::new("agent-1", project.id.clone(), Duration::seconds(3600), Utc::now()), true)
            .await
            .unwrap();
        let second = backend
            .create_session(taskdriver::Session::new("agent-1", project.id.clone(), Duration::seconds(3600), Utc::now()), true)
            .await
            .unwrap();
        assert_eq!(first.token, second.token);
    })
    .await;
}

#[tokio::test]
async fn expired_session_reads_as_not_found_i6() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let session = backend
            .create_session(taskdriver::Session::new("agent-1", project.id.clone(), Duration::seconds(0), Utc::now()), false)
            .await
            .unwrap();
        let read = backend.get_session(&session.token, Utc::now() + Duration::seconds(1)).await.unwrap();
        assert!(read.is_none());
    })
    .await;
}

#[tokio::test]
async fn project_update_and_status_patch_round_trips() {
    with_backends(|backend| async move {
        let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
        backend.create_project(project.clone()).await.unwrap();
        let updated = backend
            .update_project(
                &project.id,
                ProjectPatch {
                    status: Some(taskdriver::ProjectStatus::Closed),
                    ..Default::default()
                },
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, taskdriver::ProjectStatus::Closed);
        let listed_active_only = backend.list_projects(false).await.unwrap();
        assert!(listed_active_only.is_empty());
        let listed_all = backend.list_projects(true).await.unwrap();
        assert_eq!(listed_all.len(), 1);
    })
    .await;
}
