pub mod types;
pub mod redis;
pub mod config;
pub mod telemetry;

// Re-export commonly used types for convenience
pub use types::{
    Assignment, GradedAssignment, GradingInfo, GradingTarget, Rejection, RegradeRequest,
    RegradeResult, SubmissionHistoryItem, SubmissionRecord, SubmissionSummary,
};
pub use config::Config;
