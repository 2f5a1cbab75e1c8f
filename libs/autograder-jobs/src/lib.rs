pub mod lockmanager;
pub mod jobmanager;


pub use jobmanager::{BackgroundJob, Job, JobError, JobOptions, JobOutput, WorkError};
pub use lockmanager::{KeyedLockGuard, LockManager};
