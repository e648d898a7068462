//! A lease-based task queue broker.
//!
//! Ephemeral worker processes ("agents") pull tasks from project-scoped
//! queues, hold an exclusive time-bounded lease while executing, and
//! either complete, fail with bounded retry, or lose the lease and have
//! the task reclaimed by the [`engine::Reaper`]. Tasks are instantiated
//! from reusable [`domain::TaskType`] templates with `{{name}}` variable
//! substitution, and duplicate submissions are reconciled per type.
//!
//! # Module organization
//!
//! - [`ids`] — opaque identifier newtypes for every entity kind.
//! - [`error`] — the one error type every public operation returns.
//! - [`config`] — broker-wide configuration with sane defaults.
//! - [`template`] — `{{name}}` parsing and binding.
//! - [`domain`] — entity types and their own invariants (state machine,
//!   patch application, expiry checks).
//! - [`store`] — the pluggable storage contract and its backends
//!   (in-memory, single-node file, and optional Redis/DynamoDB).
//! - [`engine`] — the [`engine::Broker`] (fetch/complete/fail/extend,
//!   duplicate policy, template validation, stats) and [`engine::Reaper`]
//!   (periodic lease reclaim).

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ids;
pub mod store;
pub mod template;

pub use config::{BrokerConfig, RetryBackoff};
pub use domain::{DuplicatePolicy, Project, ProjectPatch, ProjectStats, ProjectStatus, Session, Task, TaskAttempt, TaskStatus, TaskType};
pub use engine::{Broker, BulkCreateResult, FetchResult, Reaper};
pub use error::{BrokerError, Result};
pub use ids::{ProjectId, SessionToken, TaskId, TaskTypeId};
pub use store::{ReapOutcome, StorageBackend, TaskFilter};
