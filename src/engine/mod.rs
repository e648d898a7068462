pub mod broker;
pub mod reaper;

pub use broker::{Broker, BulkCreateResult, FetchResult};
pub use reaper::Reaper;
