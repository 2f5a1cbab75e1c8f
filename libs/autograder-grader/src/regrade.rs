/// Regrade Orchestrator
///
/// **Core Responsibility:**
/// Re-run the grader over the latest stored submission of many users of one
/// assignment, as a single job:
/// - one regrade per course at a time (`regrade-course-{course}` lock)
/// - at most `pool_size` users graded concurrently
/// - each user serialized on `regrade-course-{course}-{user}`
/// - users already regraded since `after` come back from storage untouched
///
/// A user's regrade never fails the batch. Missing history, sandbox failures,
/// rejections and soft failures all come back as `None`.

use crate::fsutil;
use crate::grader::{GradeOptions, GradeOutcome, Grader};
use anyhow::Context;
use autograder_common::types::{Assignment, RegradeRequest, RegradeResult, SubmissionHistoryItem};
use autograder_jobs::{Job, JobError, JobOptions, JobOutput};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Role regraded when a request names nobody
pub const DEFAULT_SELECTOR: &str = "student";

pub type RegradeResults = HashMap<String, Option<SubmissionHistoryItem>>;

#[derive(Debug, Clone)]
pub struct RegradeOptions {
    pub job: JobOptions,
    pub users: Vec<String>,
    /// Submissions recorded at or after this instant count as already
    /// regraded. Defaults to the start of the call.
    pub after: Option<DateTime<Utc>>,
    pub grade_options: GradeOptions,
    pub assignment: Assignment,
    /// Overrides the configured per-course pool size
    pub pool_size: Option<usize>,
}

#[derive(Debug, Error)]
pub enum RegradeError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("failed to resolve users for course '{course}': {error:#}")]
    ResolveUsers { course: String, error: anyhow::Error },
}

pub fn course_lock_key(course: &str) -> String {
    format!("regrade-course-{}", course)
}

pub fn user_lock_key(course: &str, user: &str) -> String {
    format!("regrade-course-{}-{}", course, user)
}

/// Run a regrade and report `(results, pending)`.
///
/// In wait mode `results` covers every user and `pending` is 0. Otherwise
/// `results` holds only users already regraded since `after`, and `pending`
/// counts the users still being graded in the background.
pub async fn regrade_submissions(
    grader: &Arc<Grader>,
    options: RegradeOptions,
) -> Result<(RegradeResults, usize), RegradeError> {
    let output = start_regrade(grader, options).await?;

    let pending = output.remaining_items.len();
    let mut results = output.result_items;
    for failure in output.work_errors {
        warn!(user = %failure.item, error = %format!("{:#}", failure.error), "Regrade failed for user");
        results.insert(failure.item, None);
    }

    Ok((results, pending))
}

/// Like [`regrade_submissions`], but hands back the raw job output, including
/// the background handle of a non-waiting run.
#[instrument(
    skip_all,
    fields(
        course = %options.assignment.course_id,
        assignment = %options.assignment.id,
        users = options.users.len(),
        wait = options.job.wait_for_completion
    )
)]
pub async fn start_regrade(
    grader: &Arc<Grader>,
    options: RegradeOptions,
) -> Result<JobOutput<String, Option<SubmissionHistoryItem>>, RegradeError> {
    let after = options.after.unwrap_or_else(Utc::now);
    let pool_size = options.pool_size.unwrap_or(grader.settings().regrade_pool_size);
    let course = options.assignment.course_id.clone();
    let assignment = Arc::new(options.assignment);
    let grade_options = Arc::new(options.grade_options);

    let store = grader.store();
    let survey_assignment = assignment.clone();
    let work_grader = grader.clone();
    let key_course = course.clone();

    let job = Job::new(grader.locks(), options.users)
        .with_options(options.job)
        .with_lock_key(course_lock_key(&course))
        .with_pool_size(pool_size)
        .with_retrieve_fn(move |users: Vec<String>| {
            let store = store.clone();
            let assignment = survey_assignment.clone();
            async move {
                store
                    .get_recent_submission_survey(&assignment, &users, after)
                    .await
            }
        })
        .with_work_fn(move |user: String, cancel: CancellationToken| {
            let grader = work_grader.clone();
            let assignment = assignment.clone();
            let grade_options = grade_options.clone();
            async move { regrade_user(&grader, &assignment, &grade_options, &user, &cancel).await }
        })
        .with_work_item_key_fn(move |user: &String| user_lock_key(&key_course, user));

    Ok(job.run().await?)
}

/// Regrade one user's latest submission in a scratch directory
async fn regrade_user(
    grader: &Grader,
    assignment: &Assignment,
    options: &GradeOptions,
    user: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<Option<SubmissionHistoryItem>> {
    let target = assignment.target(user);
    if !target.is_path_safe() {
        anyhow::bail!("'{}' does not name a safe regrade directory", target);
    }

    let Some(previous) = grader
        .store()
        .get_most_recent_submission(&target)
        .await
        .with_context(|| format!("Failed to load previous submission of {}", target))?
    else {
        debug!(user = %user, "No previous submission, skipping");
        return Ok(None);
    };

    let prefix = format!("regrade-{}-{}-{}-", assignment.course_id, assignment.id, user);
    let temp = fsutil::make_temp_dir(&grader.settings().temp_dir, &prefix)
        .context("Failed to create regrade temp dir")?;

    let archive = previous.input_files_gzip;
    let unpack_dir = temp.path().to_path_buf();
    tokio::task::spawn_blocking(move || fsutil::targz_to_dir(&archive, &unpack_dir))
        .await
        .context("Archive expansion task failed")?
        .with_context(|| format!("Failed to expand archived input of {}", target))?;

    let grade_options = GradeOptions {
        proxy_time: Some(previous.info.grading_start_time),
        ..options.clone()
    };

    let result = grader
        .grade(
            assignment,
            temp.path(),
            user,
            &previous.info.message,
            &grade_options,
            cancel,
        )
        .await;

    if options.leave_temp_dir {
        let kept = fsutil::retain_temp_dir(temp);
        info!(dir = %kept.display(), "Keeping regrade temp dir");
    }

    match result {
        Ok(GradeOutcome::Graded(graded)) => Ok(Some(graded.info.to_history_item())),
        Ok(GradeOutcome::Rejected(rejection)) => {
            warn!(user = %user, reason = %rejection, "Regrade rejected");
            Ok(None)
        }
        Ok(GradeOutcome::SoftFailure { message, .. }) => {
            warn!(user = %user, reason = %message, "Regrade did not complete");
            Ok(None)
        }
        Err(e) => {
            warn!(user = %user, error = %e, "Regrade hit an infrastructure failure");
            Ok(None)
        }
    }
}

/// Entry point for queued regrade requests: resolve selectors to users, then
/// regrade as the requesting operator with rejection policies off.
#[instrument(
    skip_all,
    fields(
        request_id = %request.id,
        course = %request.assignment.course_id,
        assignment = %request.assignment.id
    )
)]
pub async fn handle_regrade(
    grader: &Arc<Grader>,
    request: &RegradeRequest,
    cancel: CancellationToken,
) -> Result<RegradeResult, RegradeError> {
    let course = &request.assignment.course_id;
    let selectors = if request.selectors.is_empty() {
        vec![DEFAULT_SELECTOR.to_string()]
    } else {
        request.selectors.clone()
    };

    let users = grader
        .store()
        .resolve_course_users(course, &selectors)
        .await
        .map_err(|error| RegradeError::ResolveUsers {
            course: course.clone(),
            error,
        })?;

    info!(selectors = ?selectors, resolved = users.len(), "Resolved regrade users");

    let options = RegradeOptions {
        job: JobOptions {
            wait_for_completion: request.wait_for_completion,
            cancel,
            retain_original_context: false,
        },
        users: users.clone(),
        after: request.after,
        grade_options: GradeOptions {
            check_rejection: false,
            proxy_user: request.requested_by.clone(),
            ..grader.default_grade_options()
        },
        assignment: request.assignment.clone(),
        pool_size: None,
    };

    let (results, pending) = regrade_submissions(grader, options).await?;

    Ok(RegradeResult {
        request_id: request.id,
        users,
        results,
        pending,
        error: None,
        completed_at: Utc::now(),
    })
}
