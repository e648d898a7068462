//! Background lease-reclaim loop (§4.3), grounded on the interval-plus-
//! per-tick-error-isolation shape of a plain sqlx reaper loop elsewhere in
//! the broader example pack: `tokio::time::interval`, one sweep per tick,
//! and a failing sweep that logs and moves on rather than aborting the
//! loop.

use std::sync::Arc;

use crate::ids::ProjectId;
use crate::store::{ReapOutcome, StorageBackend};

pub struct Reaper<B: StorageBackend> {
    backend: Arc<B>,
}

impl<B: StorageBackend + 'static> Reaper<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Sweeps every project in `project_ids` once, logging (not
    /// propagating) per-project failures so one bad project never stalls
    /// the rest of the sweep.
    pub async fn sweep_once(&self, project_ids: &[ProjectId]) -> ReapOutcome {
        let mut total = ReapOutcome::default();
        for project_id in project_ids {
            match self.backend.reap_sweep(project_id, chrono::Utc::now()).await {
                Ok(outcome) => {
                    total.reclaimed_tasks += outcome.reclaimed_tasks;
                    total.cleaned_agents += outcome.cleaned_agents;
                }
                Err(err) => {
                    tracing::warn!(project_id = %project_id, error = %err, "reaper sweep failed for project");
                }
            }
        }
        total
    }

    /// Spawns the periodic loop. `list_active_projects` is re-invoked
    /// every tick so newly created projects are picked up without a
    /// restart.
    pub fn spawn<F, Fut>(self: Arc<Self>, interval: std::time::Duration, list_active_projects: F) -> tokio::task::JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<ProjectId>> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let project_ids = list_active_projects().await;
                let outcome = self.sweep_once(&project_ids).await;
                if outcome.reclaimed_tasks > 0 {
                    tracing::info!(
                        reclaimed_tasks = outcome.reclaimed_tasks,
                        cleaned_agents = outcome.cleaned_agents,
                        "reaper sweep reclaimed expired leases"
                    );
                }
            }
        })
    }
}
