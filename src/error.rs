//! The one error type every public operation returns.

use crate::ids::{ProjectId, TaskId, TaskTypeId};

/// Errors surfaced by the broker and its storage backends.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("task {task_id} is {actual}, expected {expected}")]
    InvalidState {
        task_id: TaskId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("task {task_id} is not assigned to agent {agent}")]
    NotAssignedToAgent { task_id: TaskId, agent: String },

    #[error("duplicate task for type {type_id}")]
    DuplicateTask {
        type_id: TaskTypeId,
        variables: std::collections::HashMap<String, String>,
        existing_task_id: TaskId,
    },

    #[error("missing template variables: {}", .names.join(", "))]
    MissingTemplateVariables { names: Vec<String> },

    #[error("validation error on {field}: {reason}")]
    ValidationError { field: &'static str, reason: String },

    #[error("lock timeout acquiring project {project_id}")]
    LockTimeout { project_id: ProjectId },

    #[error("storage unavailable: {reason}")]
    StorageUnavailable { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    pub fn already_exists(entity: &'static str, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            key: key.into(),
        }
    }

    /// Transient failures the caller may retry with backoff; everything
    /// else is a stable outcome worth surfacing immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::StorageUnavailable { .. })
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_includes_entity_and_key() {
        let err = BrokerError::not_found("project", "p1");
        assert_eq!(err.to_string(), "project not found: p1");
    }

    #[test]
    fn lock_timeout_and_storage_unavailable_are_transient() {
        let project_id = ProjectId::from_str_unchecked("p1");
        assert!(BrokerError::LockTimeout { project_id }.is_transient());
        assert!(BrokerError::StorageUnavailable {
            reason: "x".into()
        }
        .is_transient());
    }

    #[test]
    fn validation_error_is_not_transient() {
        let err = BrokerError::ValidationError {
            field: "name",
            reason: "empty".into(),
        };
        assert!(!err.is_transient());
    }
}
