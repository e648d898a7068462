use serde::{Deserialize, Serialize};

use crate::ids::{ProjectId, TaskTypeId};
use crate::template;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    Allow,
    Ignore,
    Fail,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self::Allow
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskType {
    pub id: TaskTypeId,
    pub project_id: ProjectId,
    pub name: String,
    pub template: String,
    pub variables: Vec<String>,
    pub max_retries: u32,
    pub lease_duration_minutes: f64,
    pub duplicate_policy: DuplicatePolicy,
}

impl TaskType {
    /// Validates `variables` are a subset of the template's parsed names
    /// before constructing the record. Rejected at type creation (§4.2).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project_id: ProjectId,
        name: impl Into<String>,
        template: impl Into<String>,
        variables: Vec<String>,
        max_retries: u32,
        lease_duration_minutes: f64,
        duplicate_policy: DuplicatePolicy,
    ) -> crate::error::Result<Self> {
        let template = template.into();
        template::validate_declared_subset(&variables, &template)?;
        Ok(Self {
            id: TaskTypeId::generate(),
            project_id,
            name: name.into(),
            template,
            variables,
            max_retries,
            lease_duration_minutes,
            duplicate_policy,
        })
    }

    pub fn apply(&mut self, patch: TaskTypePatch) -> crate::error::Result<()> {
        let template = patch.template.unwrap_or_else(|| self.template.clone());
        let variables = patch.variables.unwrap_or_else(|| self.variables.clone());
        template::validate_declared_subset(&variables, &template)?;
        self.template = template;
        self.variables = variables;
        if let Some(max_retries) = patch.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(lease_minutes) = patch.lease_duration_minutes {
            self.lease_duration_minutes = lease_minutes;
        }
        if let Some(policy) = patch.duplicate_policy {
            self.duplicate_policy = policy;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskTypePatch {
    pub template: Option<String>,
    pub variables: Option<Vec<String>>,
    pub max_retries: Option<u32>,
    pub lease_duration_minutes: Option<f64>,
    pub duplicate_policy: Option<DuplicatePolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_declared_variable_not_in_template() {
        let err = TaskType::new(
            ProjectId::from_str_unchecked("p1"),
            "greet",
            "hello {{who}}",
            vec!["ghost".to_string()],
            3,
            10.0,
            DuplicatePolicy::Allow,
        )
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn new_accepts_subset_of_template_variables() {
        let task_type = TaskType::new(
            ProjectId::from_str_unchecked("p1"),
            "greet",
            "hello {{who}}",
            vec!["who".to_string()],
            3,
            10.0,
            DuplicatePolicy::Allow,
        )
        .unwrap();
        assert_eq!(task_type.variables, vec!["who".to_string()]);
    }

    #[test]
    fn apply_patch_validates_new_template_against_existing_variables() {
        let mut task_type = TaskType::new(
            ProjectId::from_str_unchecked("p1"),
            "greet",
            "hello {{who}}",
            vec!["who".to_string()],
            3,
            10.0,
            DuplicatePolicy::Allow,
        )
        .unwrap();
        let err = task_type
            .apply(TaskTypePatch {
                template: Some("static text".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(err.to_string().contains("who"));
    }
}
