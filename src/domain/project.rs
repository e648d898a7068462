use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BrokerConfig;
use crate::ids::ProjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub instructions: Option<String>,
    pub status: ProjectStatus,
    pub default_max_retries: u32,
    pub default_lease_duration_minutes: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        instructions: Option<String>,
        config: &BrokerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ProjectId::generate(),
            name: name.into(),
            description,
            instructions,
            status: ProjectStatus::Active,
            default_max_retries: config.default_max_retries,
            default_lease_duration_minutes: config.default_lease_duration_minutes,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, patch: ProjectPatch, now: DateTime<Utc>) {
        if let Some(description) = patch.description {
            self.description = description;
        }
        if let Some(instructions) = patch.instructions {
            self.instructions = instructions;
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(max_retries) = patch.default_max_retries {
            self.default_max_retries = max_retries;
        }
        if let Some(lease_minutes) = patch.default_lease_duration_minutes {
            self.default_lease_duration_minutes = lease_minutes;
        }
        self.updated_at = now;
    }
}

/// A partial update; `None` fields are left untouched, `Some(None)` clears
/// an optional field.
#[derive(Debug, Clone, Default)]
pub struct ProjectPatch {
    pub description: Option<Option<String>>,
    pub instructions: Option<Option<String>>,
    pub status: Option<ProjectStatus>,
    pub default_max_retries: Option<u32>,
    pub default_lease_duration_minutes: Option<f64>,
}

/// Pure derivation over a project's task set (§4.5); never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub queued: usize,
    pub running: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_project_snapshots_defaults_from_config() {
        let config = BrokerConfig::default().with_default_max_retries(5);
        let project = Project::new("demo", None, None, &config, Utc::now());
        assert_eq!(project.default_max_retries, 5);
        assert_eq!(project.status, ProjectStatus::Active);
    }

    #[test]
    fn apply_patch_only_touches_provided_fields() {
        let config = BrokerConfig::default();
        let now = Utc::now();
        let mut project = Project::new("demo", Some("d".into()), None, &config, now);
        let patch = ProjectPatch {
            status: Some(ProjectStatus::Closed),
            ..Default::default()
        };
        project.apply(patch, now);
        assert_eq!(project.status, ProjectStatus::Closed);
        assert_eq!(project.description, Some("d".to_string()));
    }

    #[test]
    fn apply_patch_can_clear_optional_field() {
        let config = BrokerConfig::default();
        let now = Utc::now();
        let mut project = Project::new("demo", Some("d".into()), None, &config, now);
        let patch = ProjectPatch {
            description: Some(None),
            ..Default::default()
        };
        project.apply(patch, now);
        assert_eq!(project.description, None);
    }
}
