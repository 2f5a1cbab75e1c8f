/// Grade Coordinator
///
/// **Core Responsibility:**
/// Grade one submission for one (course, assignment, user) target:
/// 1. Serialize on the target's lock
/// 2. Apply rejection policies (attempt window, due date)
/// 3. Stage `input/` and `output/` in a fresh submission directory
/// 4. Delegate to the sandbox runner
/// 5. Summarize, write `summary.json` and persist the record
///
/// The target lock is an RAII guard held for the whole attempt, so it is
/// released on success, on error and on cancellation alike.

use crate::evaluator::{self, SUMMARY_FILE};
use crate::fsutil;
use crate::sandbox::{RawOutput, SandboxError, SandboxOutcome, SandboxRequest, SandboxRunner};
use crate::store::SubmissionStore;
use autograder_common::types::{
    Assignment, GradedAssignment, GradingInfo, GradingTarget, Rejection, SubmissionHistoryItem,
    SubmissionRecord, SubmissionSummary,
};
use autograder_common::Config;
use autograder_jobs::LockManager;
use chrono::{DateTime, TimeDelta, Utc};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Grader-wide settings derived from [`Config`]
#[derive(Debug, Clone)]
pub struct GraderSettings {
    pub submissions_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub grading_timeout: Duration,
    pub max_output_bytes: usize,
    pub regrade_pool_size: usize,
    pub leave_temp_dirs: bool,
    pub use_fake_submissions_dir: bool,
}

impl From<&Config> for GraderSettings {
    fn from(config: &Config) -> Self {
        Self {
            submissions_dir: config.submissions_dir(),
            temp_dir: config.temp_dir.clone(),
            grading_timeout: Duration::from_millis(config.grading_timeout_ms),
            max_output_bytes: config.max_output_bytes,
            regrade_pool_size: config.regrade_course_pool_size,
            leave_temp_dirs: config.debug,
            use_fake_submissions_dir: config.no_store,
        }
    }
}

/// Per-attempt knobs
#[derive(Debug, Clone, Default)]
pub struct GradeOptions {
    pub check_rejection: bool,
    /// Operator who triggered the attempt on someone else's behalf
    pub proxy_user: Option<String>,
    /// Grading start time to record instead of now (regrades keep the original)
    pub proxy_time: Option<DateTime<Utc>>,
    pub leave_temp_dir: bool,
    pub use_fake_submissions_dir: bool,
}

#[derive(Debug, Clone)]
pub struct GradingResult {
    pub info: GradingInfo,
    pub graded: GradedAssignment,
    pub summary: SubmissionSummary,
    pub output: RawOutput,
    /// Staging directory of the attempt. Gone once grading returns unless it
    /// lives in the work dir or temp dirs are kept.
    pub submission_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub enum GradeOutcome {
    Graded(GradingResult),
    Rejected(Rejection),
    SoftFailure { message: String, output: RawOutput },
}

impl GradeOutcome {
    pub fn history_item(&self) -> Option<SubmissionHistoryItem> {
        match self {
            GradeOutcome::Graded(result) => Some(result.info.to_history_item()),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum GradeError {
    #[error("grading of {target} was cancelled before it started")]
    Cancelled { target: String },

    #[error("failed to stage submission for {target}: {source}")]
    Staging {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("sandbox failed for {target}: {source}")]
    Sandbox {
        target: String,
        #[source]
        source: SandboxError,
    },

    #[error("storage failed for {target}: {error:#}")]
    Storage { target: String, error: anyhow::Error },
}

impl GradeError {
    /// Grader output captured before the failure, if any
    pub fn output(&self) -> Option<&RawOutput> {
        match self {
            GradeError::Sandbox { source, .. } if !source.output.is_empty() => Some(&source.output),
            _ => None,
        }
    }
}

/// Where one attempt is staged. Holding the handle keeps a scoped temp dir alive.
struct StagedSubmission {
    root: PathBuf,
    short_id: String,
    _temp: Option<TempDir>,
}

impl StagedSubmission {
    fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }
}

pub struct Grader {
    locks: Arc<LockManager>,
    runner: Arc<dyn SandboxRunner>,
    store: Arc<dyn SubmissionStore>,
    settings: GraderSettings,
}

impl Grader {
    pub fn new(
        locks: Arc<LockManager>,
        runner: Arc<dyn SandboxRunner>,
        store: Arc<dyn SubmissionStore>,
        settings: GraderSettings,
    ) -> Self {
        Self {
            locks,
            runner,
            store,
            settings,
        }
    }

    pub fn locks(&self) -> Arc<LockManager> {
        self.locks.clone()
    }

    pub fn store(&self) -> Arc<dyn SubmissionStore> {
        self.store.clone()
    }

    pub fn settings(&self) -> &GraderSettings {
        &self.settings
    }

    /// Options for an ordinary student submission
    pub fn default_grade_options(&self) -> GradeOptions {
        GradeOptions {
            check_rejection: true,
            proxy_user: None,
            proxy_time: None,
            leave_temp_dir: self.settings.leave_temp_dirs,
            use_fake_submissions_dir: self.settings.use_fake_submissions_dir,
        }
    }

    #[instrument(skip_all, fields(course = %assignment.course_id, assignment = %assignment.id, user = %user))]
    pub async fn grade(
        &self,
        assignment: &Assignment,
        submission_path: &Path,
        user: &str,
        message: &str,
        options: &GradeOptions,
        cancel: &CancellationToken,
    ) -> Result<GradeOutcome, GradeError> {
        let target = assignment.target(user);
        let lock_key = target.lock_key();

        let _guard = self
            .locks
            .lock_cancellable(&lock_key, cancel)
            .await
            .ok_or_else(|| GradeError::Cancelled {
                target: target.to_string(),
            })?;

        let start_time = Utc::now();

        if options.check_rejection {
            if let Some(rejection) = self.check_rejection(assignment, &target, start_time).await? {
                info!(target_id = %target, reason = %rejection, "Submission rejected");
                return Ok(GradeOutcome::Rejected(rejection));
            }
        }

        let staging_error = |source: io::Error| GradeError::Staging {
            target: target.to_string(),
            source,
        };

        let staged = self.stage(&target, options).await.map_err(staging_error)?;
        let input_dir = staged.input_dir();
        let output_dir = staged.output_dir();

        copy_submission(submission_path, &input_dir).await.map_err(staging_error)?;
        tokio::fs::create_dir_all(&output_dir).await.map_err(staging_error)?;

        let grading_id = format!("{}::{}", target, staged.short_id);
        debug!(grading_id = %grading_id, dir = %staged.root.display(), "Submission staged");

        let request = SandboxRequest {
            assignment,
            target: &target,
            grading_id: &grading_id,
            input_dir: &input_dir,
            output_dir: &output_dir,
            timeout: assignment
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.settings.grading_timeout),
            max_output_bytes: self.settings.max_output_bytes,
        };

        let outcome = self
            .runner
            .execute(&request, cancel)
            .await
            .map_err(|source| GradeError::Sandbox {
                target: target.to_string(),
                source,
            })?;

        let (graded, output) = match outcome {
            SandboxOutcome::Completed { graded, output } => (graded, output),
            SandboxOutcome::Rejected(rejection) => {
                info!(grading_id = %grading_id, reason = %rejection, "Grader run rejected");
                return Ok(GradeOutcome::Rejected(rejection));
            }
            SandboxOutcome::SoftFailure { message, output } => {
                warn!(grading_id = %grading_id, reason = %message, "Grader run failed");
                return Ok(GradeOutcome::SoftFailure { message, output });
            }
        };

        let info = GradingInfo {
            id: grading_id.clone(),
            short_id: staged.short_id.clone(),
            course_id: target.course.clone(),
            assignment_id: target.assignment.clone(),
            user: target.user.clone(),
            message: message.to_string(),
            max_points: graded.max_points(),
            score: graded.score(),
            grading_start_time: options.proxy_time.unwrap_or(start_time),
            grading_end_time: Utc::now(),
            proxy_user: options.proxy_user.clone(),
        };
        let summary = evaluator::summarize(&info, &graded);

        let summary_json = serde_json::to_vec_pretty(&summary).map_err(|e| staging_error(e.into()))?;
        tokio::fs::write(output_dir.join(SUMMARY_FILE), summary_json)
            .await
            .map_err(staging_error)?;

        let input_files_gzip = archive_dir(&input_dir).await.map_err(staging_error)?;

        let record = SubmissionRecord {
            info: info.clone(),
            summary: summary.clone(),
            input_files_gzip,
            recorded_at: Utc::now(),
        };
        self.store
            .save_submission(record)
            .await
            .map_err(|error| GradeError::Storage {
                target: target.to_string(),
                error,
            })?;

        info!(
            grading_id = %grading_id,
            score = info.score,
            max_points = info.max_points,
            proxy_user = info.proxy_user.as_deref().unwrap_or(""),
            "Submission graded"
        );

        Ok(GradeOutcome::Graded(GradingResult {
            info,
            graded,
            summary,
            output,
            submission_dir: staged.root.clone(),
        }))
    }

    /// Due date first, then the attempt window
    async fn check_rejection(
        &self,
        assignment: &Assignment,
        target: &GradingTarget,
        now: DateTime<Utc>,
    ) -> Result<Option<Rejection>, GradeError> {
        if assignment.reject_late {
            if let Some(due_date) = assignment.due_date {
                if now > due_date {
                    return Ok(Some(Rejection::LateSubmission { due_date }));
                }
            }
        }

        let Some(limit) = assignment.submission_limit else {
            return Ok(None);
        };

        // Windows beyond chrono's range cover all history
        let window = TimeDelta::try_seconds(limit.window_secs.max(0)).unwrap_or(TimeDelta::MAX);
        let since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let times = self
            .store
            .get_submission_times_since(target, since)
            .await
            .map_err(|error| GradeError::Storage {
                target: target.to_string(),
                error,
            })?;

        let max_attempts = limit.max_attempts as usize;
        if times.len() < max_attempts {
            return Ok(None);
        }

        // The attempt that has to age out of the window before another fits
        let next_allowed = match times.len().checked_sub(max_attempts).and_then(|i| times.get(i)) {
            Some(oldest) if max_attempts > 0 => oldest.checked_add_signed(window),
            _ => now.checked_add_signed(window),
        }
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Ok(Some(Rejection::MaxAttempts {
            max_attempts: limit.max_attempts,
            window_secs: limit.window_secs,
            next_allowed,
        }))
    }

    /// Create the attempt directory. Ids are millisecond timestamps, bumped
    /// until unused; the target lock keeps this race free.
    async fn stage(&self, target: &GradingTarget, options: &GradeOptions) -> io::Result<StagedSubmission> {
        if !target.is_path_safe() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' does not name a safe submission directory", target),
            ));
        }

        let (parent, temp) = if options.use_fake_submissions_dir {
            let temp = fsutil::make_temp_dir(&self.settings.temp_dir, "autograding-submissions-")?;
            let parent = temp.path().to_path_buf();
            if options.leave_temp_dir {
                info!(dir = %parent.display(), "Keeping temp submission dir");
                (fsutil::retain_temp_dir(temp), None)
            } else {
                (parent, Some(temp))
            }
        } else {
            let parent = self
                .settings
                .submissions_dir
                .join(&target.course)
                .join(&target.assignment)
                .join(&target.user);
            tokio::fs::create_dir_all(&parent).await?;
            (parent, None)
        };

        let mut stamp = Utc::now().timestamp_millis();
        loop {
            let root = parent.join(stamp.to_string());
            match tokio::fs::create_dir(&root).await {
                Ok(()) => {
                    return Ok(StagedSubmission {
                        root,
                        short_id: stamp.to_string(),
                        _temp: temp,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => stamp += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

async fn copy_submission(src: &Path, dst: &Path) -> io::Result<()> {
    let (src, dst) = (src.to_path_buf(), dst.to_path_buf());
    tokio::task::spawn_blocking(move || fsutil::copy_dir_all(&src, &dst))
        .await
        .map_err(io::Error::other)?
}

async fn archive_dir(dir: &Path) -> io::Result<Vec<u8>> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || fsutil::dir_to_targz(&dir))
        .await
        .map_err(io::Error::other)?
}
