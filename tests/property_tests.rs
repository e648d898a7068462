//! Property-based coverage of the testable invariants (P1-P7): no
//! double-assignment, eventual drainability, the retry bound, lease
//! monotonicity, template round-trip, duplicate-policy correctness, and
//! project isolation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;
use taskdriver::store::memory::MemoryBackend;
use taskdriver::{Broker, BrokerConfig, DuplicatePolicy, StorageBackend, TaskId, TaskStatus};

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

// ─── P2: eventual drainability ──────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn p2_eventual_drainability(n in 1usize..12) {
        rt().block_on(async {
            let broker = Broker::new(Arc::new(MemoryBackend::new()), BrokerConfig::default());
            let project = broker.create_project("P", None, None).await.unwrap();
            let task_type = broker
                .create_task_type(project.id.clone(), "t", "x", vec![], None, Some(0), Some(5.0))
                .await
                .unwrap();
            for _ in 0..n {
                broker
                    .create_task(project.id.clone(), task_type.id.clone(), HashMap::new(), None, None)
                    .await
                    .unwrap();
            }
            for i in 0..n {
                let fetched = broker.fetch_next(&project.id, Some(format!("agent-{i}"))).await.unwrap();
                prop_assert!(fetched.task.is_some());
            }
            let last = broker.fetch_next(&project.id, Some("extra".to_string())).await.unwrap();
            prop_assert!(last.task.is_none());
            Ok(())
        }).unwrap();
    }
}

// ─── P3: retry bound ────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn p3_retry_count_never_exceeds_max(max_retries in 0u32..5) {
        rt().block_on(async {
            let broker = Broker::new(Arc::new(MemoryBackend::new()), BrokerConfig::default());
            let project = broker.create_project("P", None, None).await.unwrap();
            let task_type = broker
                .create_task_type(project.id.clone(), "t", "x", vec![], None, Some(max_retries), Some(5.0))
                .await
                .unwrap();
            let task = broker
                .create_task(project.id.clone(), task_type.id.clone(), HashMap::new(), None, None)
                .await
                .unwrap();

            for attempt in 0..(max_retries + 3) {
                let fetched = broker.fetch_next(&project.id, Some(format!("a{attempt}"))).await.unwrap();
                let Some(t) = fetched.task else { break };
                let outcome = broker.fail(&t.id, &fetched.agent_name, serde_json::json!({}), true).await.unwrap();
                prop_assert!(outcome.retry_count <= max_retries + 1);
                if outcome.status == TaskStatus::Failed {
                    prop_assert_eq!(outcome.retry_count, max_retries + 1);
                    break;
                }
            }
            let _ = task.id;
            Ok(())
        }).unwrap();
    }
}

// ─── P4: lease monotonicity ─────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn p4_extend_lease_never_decreases_expiry(extensions in 1usize..6) {
        rt().block_on(async {
            let backend = MemoryBackend::new();
            let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
            backend.create_project(project.clone()).await.unwrap();
            let tt = taskdriver::TaskType::new(project.id.clone(), "t", "x", vec![], 1, 5.0, DuplicatePolicy::Allow).unwrap();
            backend.create_task_type(tt.clone()).await.unwrap();
            let task = taskdriver::Task::new_queued(TaskId::generate(), project.id.clone(), tt.id.clone(), None, HashMap::new(), 1, Utc::now());
            backend.insert_queued_task(task.clone()).await.unwrap();
            backend.atomic_fetch_and_lease(&project.id, "a1", Utc::now(), Duration::minutes(5)).await.unwrap();

            let mut prior = backend.get_task(&task.id).await.unwrap().unwrap().lease_expires_at.unwrap();
            for _ in 0..extensions {
                let extended = backend.atomic_extend_lease(&task.id, "a1", Duration::minutes(1), Utc::now()).await.unwrap();
                let now_expiry = extended.lease_expires_at.unwrap();
                prop_assert!(now_expiry >= prior);
                prior = now_expiry;
            }
            Ok(())
        }).unwrap();
    }
}

// ─── P5: template round-trip ────────────────────────────────────────────────

fn arb_var_name() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_]{0,8}"
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn p5_bound_template_has_no_leftover_placeholders(names in prop::collection::hash_set(arb_var_name(), 1..5)) {
        let names: Vec<String> = names.into_iter().collect();
        let template = names.iter().map(|n| format!("{{{{{n}}}}}")).collect::<Vec<_>>().join(" / ");
        let mut bindings = HashMap::new();
        for (i, name) in names.iter().enumerate() {
            bindings.insert(name.clone(), format!("value{i}"));
        }
        // B ⊇ V: add one extra unrelated binding, which must be tolerated.
        bindings.insert("extra_unused".to_string(), "ignored".to_string());

        let bound = taskdriver::template::bind(&template, &bindings).unwrap();
        for name in &names {
            let placeholder = format!("{{{{{name}}}}}");
            prop_assert!(!bound.contains(&placeholder));
        }
    }
}

// ─── P6: duplicate-policy correctness ───────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    #[test]
    fn p6_duplicate_policy_correctness(policy_idx in 0usize..3) {
        rt().block_on(async {
            let policy = [DuplicatePolicy::Allow, DuplicatePolicy::Ignore, DuplicatePolicy::Fail][policy_idx];
            let broker = Broker::new(Arc::new(MemoryBackend::new()), BrokerConfig::default());
            let project = broker.create_project("P", None, None).await.unwrap();
            let task_type = broker
                .create_task_type(project.id.clone(), "t", "x", vec![], Some(policy), Some(0), Some(5.0))
                .await
                .unwrap();
            let mut vars = HashMap::new();
            vars.insert("k".to_string(), "v".to_string());

            let first = broker.create_task(project.id.clone(), task_type.id.clone(), vars.clone(), None, None).await.unwrap();
            let second = broker.create_task(project.id.clone(), task_type.id.clone(), vars, None, None).await;

            match policy {
                DuplicatePolicy::Allow => prop_assert_ne!(first.id, second.unwrap().id),
                DuplicatePolicy::Ignore => prop_assert_eq!(first.id, second.unwrap().id),
                DuplicatePolicy::Fail => prop_assert!(second.is_err()),
            }
            Ok(())
        }).unwrap();
    }
}

// ─── P7: project isolation ──────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    #[test]
    fn p7_fetch_never_crosses_project_boundary(project_count in 2usize..5) {
        rt().block_on(async {
            let broker = Broker::new(Arc::new(MemoryBackend::new()), BrokerConfig::default());
            let mut projects = Vec::new();
            for i in 0..project_count {
                let project = broker.create_project(format!("P{i}"), None, None).await.unwrap();
                let task_type = broker
                    .create_task_type(project.id.clone(), "t", "x", vec![], None, Some(0), Some(5.0))
                    .await
                    .unwrap();
                broker.create_task(project.id.clone(), task_type.id.clone(), HashMap::new(), None, None).await.unwrap();
                projects.push(project);
            }
            for project in &projects {
                let fetched = broker.fetch_next(&project.id, Some("agent".to_string())).await.unwrap();
                let task = fetched.task.unwrap();
                prop_assert_eq!(&task.project_id, &project.id);
            }
            Ok(())
        }).unwrap();
    }
}

// ─── P1: no double-assignment under concurrency ─────────────────────────────

#[tokio::test]
async fn p1_no_double_assignment_under_concurrent_fetch() {
    let backend = Arc::new(MemoryBackend::new());
    let project = taskdriver::Project::new("P", None, None, &BrokerConfig::default(), Utc::now());
    backend.create_project(project.clone()).await.unwrap();
    let tt = taskdriver::TaskType::new(project.id.clone(), "t", "x", vec![], 1, 5.0, DuplicatePolicy::Allow).unwrap();
    backend.create_task_type(tt.clone()).await.unwrap();
    let task = taskdriver::Task::new_queued(TaskId::generate(), project.id.clone(), tt.id.clone(), None, HashMap::new(), 1, Utc::now());
    backend.insert_queued_task(task.clone()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let backend = backend.clone();
        let project_id = project.id.clone();
        handles.push(tokio::spawn(async move {
            backend
                .atomic_fetch_and_lease(&project_id, &format!("agent-{i}"), Utc::now(), Duration::minutes(5))
                .await
                .unwrap()
        }));
    }

    let results = futures::future::join_all(handles).await;
    let winners: Vec<_> = results.into_iter().map(|r| r.unwrap()).filter_map(|t| t).collect();
    assert_eq!(winners.len(), 1, "exactly one fetch_next call should win the lease");

    let assigned: HashSet<String> = winners.iter().filter_map(|t| t.assigned_to.clone()).collect();
    assert_eq!(assigned.len(), 1);
}
