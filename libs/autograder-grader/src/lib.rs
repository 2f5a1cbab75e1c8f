pub mod evaluator;
pub mod fsutil;
pub mod grader;
pub mod redis_store;
pub mod regrade;
pub mod sandbox;
pub mod store;

#[cfg(test)]
mod testutil;

pub use grader::{GradeError, GradeOptions, GradeOutcome, Grader, GraderSettings, GradingResult};
pub use redis_store::RedisStore;
pub use regrade::{handle_regrade, regrade_submissions, start_regrade, RegradeError, RegradeOptions, RegradeResults};
pub use sandbox::{runner_from_config, SandboxError, SandboxOutcome, SandboxRequest, SandboxRunner};
pub use store::{MemoryStore, SubmissionStore};
