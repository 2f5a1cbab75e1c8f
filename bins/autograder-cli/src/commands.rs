// CLI commands for grading and regrades
use anyhow::{bail, Context, Result};
use autograder_common::redis as queue;
use autograder_common::types::{
    is_path_segment, Assignment, GradedAssignment, GradingInfo, Rejection, RegradeRequest,
    RegradeResult, SubmissionSummary,
};
use autograder_common::Config;
use autograder_grader::{
    runner_from_config, GradeOutcome, Grader, GraderSettings, MemoryStore, RedisStore,
    SubmissionStore,
};
use autograder_jobs::LockManager;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What `grade --out` writes
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GradeReport {
    Graded {
        info: GradingInfo,
        graded: GradedAssignment,
        summary: SubmissionSummary,
        output: String,
    },
    Rejected {
        reason: String,
        rejection: Rejection,
    },
    SoftFailure {
        message: String,
        output: String,
    },
}

impl From<&GradeOutcome> for GradeReport {
    fn from(outcome: &GradeOutcome) -> Self {
        match outcome {
            GradeOutcome::Graded(result) => GradeReport::Graded {
                info: result.info.clone(),
                graded: result.graded.clone(),
                summary: result.summary.clone(),
                output: result.output.combined(),
            },
            GradeOutcome::Rejected(rejection) => GradeReport::Rejected {
                reason: rejection.to_string(),
                rejection: rejection.clone(),
            },
            GradeOutcome::SoftFailure { message, output } => GradeReport::SoftFailure {
                message: message.clone(),
                output: output.combined(),
            },
        }
    }
}

/// Load an assignment definition
fn load_assignment(path: &Path) -> Result<Assignment> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read assignment file {}", path.display()))?;
    let assignment: Assignment = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse assignment file {}", path.display()))?;

    if assignment.course_id.trim().is_empty() || assignment.id.trim().is_empty() {
        bail!("Assignment needs both 'course_id' and 'id'");
    }
    if !is_path_segment(&assignment.course_id) || !is_path_segment(&assignment.id) {
        bail!("Assignment 'course_id' and 'id' must not contain '/', '\\' or be '.' / '..'");
    }
    if assignment.grader_command.is_empty() {
        bail!("Assignment 'grader_command' must not be empty");
    }

    Ok(assignment)
}

async fn connect(config: &Config) -> Result<ConnectionManager> {
    let client = redis::Client::open(config.redis_url.as_str()).context("Invalid REDIS_URL")?;
    ConnectionManager::new(client)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))
}

/// Grade a submission directory right here, with an in-memory store
pub async fn grade_local(
    assignment_path: &Path,
    submission: &Path,
    user: &str,
    message: &str,
    out: Option<&Path>,
) -> Result<()> {
    let assignment = load_assignment(assignment_path)?;
    if !is_path_segment(user) {
        bail!("User '{}' must not contain '/', '\\' or be '.' / '..'", user);
    }
    if !submission.is_dir() {
        bail!("Submission {} is not a directory", submission.display());
    }

    let config = Config::from_env();
    let runner = runner_from_config(&config)?;
    let store: Arc<dyn SubmissionStore> = Arc::new(MemoryStore::new());
    let grader = Grader::new(
        Arc::new(LockManager::new()),
        runner,
        store,
        GraderSettings::from(&config),
    );

    println!("🚀 Grading {} for {}", assignment.full_id(), user);
    println!("  Submission: {}", submission.display());

    let started = Instant::now();
    let outcome = match grader
        .grade(
            &assignment,
            submission,
            user,
            message,
            &grader.default_grade_options(),
            &CancellationToken::new(),
        )
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            if let Some(output) = e.output() {
                println!("\n📋 Grader output before the failure:\n{}", output.combined());
            }
            return Err(e).context("Grading failed");
        }
    };

    println!("  Finished in {}ms\n", started.elapsed().as_millis());

    match &outcome {
        GradeOutcome::Graded(result) => {
            println!("✅ Graded {}", result.info.id);
            println!("{}", result.graded.report());
            println!("  Staged at: {}", result.submission_dir.display());
            if !result.output.is_empty() {
                println!("\n📋 Grader output:\n{}", result.output.combined());
            }
        }
        GradeOutcome::Rejected(rejection) => {
            println!("⛔ Rejected: {}", rejection);
        }
        GradeOutcome::SoftFailure { message, output } => {
            println!("❌ {}", message);
            if !output.is_empty() {
                println!("\n📋 Grader output:\n{}", output.combined());
            }
        }
    }

    if let Some(out) = out {
        let report = serde_json::to_string_pretty(&GradeReport::from(&outcome))?;
        fs::write(out, report).with_context(|| format!("Failed to write {}", out.display()))?;
        println!("\n📝 Report written to {}", out.display());
    }

    Ok(())
}

pub fn build_regrade_request(
    assignment: Assignment,
    selectors: Vec<String>,
    wait: bool,
    requested_by: Option<String>,
    after: Option<DateTime<Utc>>,
) -> RegradeRequest {
    RegradeRequest {
        id: Uuid::new_v4(),
        assignment,
        selectors,
        wait_for_completion: wait,
        requested_by,
        after,
    }
}

/// Push a regrade request for the worker, optionally polling for its result
pub async fn queue_regrade(
    assignment_path: &Path,
    selectors: Vec<String>,
    wait: bool,
    requested_by: Option<String>,
    after: Option<DateTime<Utc>>,
    poll_secs: u64,
) -> Result<()> {
    let assignment = load_assignment(assignment_path)?;
    let config = Config::from_env();
    let mut conn = connect(&config).await?;

    let request = build_regrade_request(assignment, selectors, wait, requested_by, after);
    queue::push_regrade_request(&mut conn, &request)
        .await
        .context("Failed to queue regrade request")?;

    println!("📤 Queued regrade {} for {}", request.id, request.assignment.full_id());
    if poll_secs == 0 {
        println!("\n📋 Check on it with: autograder-cli result --id {}", request.id);
        return Ok(());
    }

    let deadline = Instant::now() + Duration::from_secs(poll_secs);
    while Instant::now() < deadline {
        if let Some(result) = queue::get_regrade_result(&mut conn, &request.id).await? {
            print_result(&result);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    println!("⏳ No result after {}s, the worker may still be busy", poll_secs);
    Ok(())
}

pub async fn show_result(id: &Uuid) -> Result<()> {
    let config = Config::from_env();
    let mut conn = connect(&config).await?;

    match queue::get_regrade_result(&mut conn, id).await? {
        Some(result) => print_result(&result),
        None => bail!("No regrade result stored for {} (unknown id or expired)", id),
    }
    Ok(())
}

pub async fn enroll(course: &str, user: &str, role: &str) -> Result<()> {
    let config = Config::from_env();
    let store = RedisStore::new(connect(&config).await?);
    store.set_course_user(course, user, role).await?;

    println!("✅ {} is now '{}' in {}", user, role, course);
    Ok(())
}

fn format_result(result: &RegradeResult) -> String {
    let mut lines = Vec::new();

    if let Some(error) = &result.error {
        lines.push(format!("❌ Regrade {} failed: {}", result.request_id, error));
        return lines.join("\n");
    }

    lines.push(format!(
        "✅ Regrade {}: {} users, {} pending",
        result.request_id,
        result.users.len(),
        result.pending
    ));

    let mut users: Vec<_> = result.results.keys().collect();
    users.sort();
    for user in users {
        match &result.results[user] {
            Some(item) => lines.push(format!("  {}: {} / {} ({})", user, item.score, item.max_points, item.id)),
            None => lines.push(format!("  {}: not regraded", user)),
        }
    }

    lines.join("\n")
}

fn print_result(result: &RegradeResult) {
    println!("{}", format_result(result));
}

#[cfg(test)]
mod tests {
    use super::*;
    use autograder_common::types::SubmissionHistoryItem;
    use std::collections::HashMap;

    #[test]
    fn test_load_assignment_validation() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.json");
        fs::write(&good, r#"{"id": "hw0", "course_id": "course101", "image": "img"}"#).unwrap();
        assert_eq!(load_assignment(&good).unwrap().full_id(), "course101::hw0");

        let empty_command = dir.path().join("bad.json");
        fs::write(
            &empty_command,
            r#"{"id": "hw0", "course_id": "course101", "image": "img", "grader_command": []}"#,
        )
        .unwrap();
        assert!(load_assignment(&empty_command).is_err());

        let escaping = dir.path().join("escaping.json");
        fs::write(&escaping, r#"{"id": "../hw0", "course_id": "course101", "image": "img"}"#).unwrap();
        assert!(load_assignment(&escaping).is_err());

        assert!(load_assignment(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn test_grade_local_refuses_escaping_user() {
        let dir = tempfile::tempdir().unwrap();
        let assignment = dir.path().join("a.json");
        fs::write(&assignment, r#"{"id": "hw0", "course_id": "course101", "image": "img"}"#).unwrap();

        let err = grade_local(&assignment, dir.path(), "../x", "", None).await.unwrap_err();
        assert!(err.to_string().contains("'../x'"));
    }

    #[test]
    fn test_rejected_report_shape() {
        let outcome = GradeOutcome::Rejected(Rejection::OutputQuota {
            limit_bytes: 10,
            actual_bytes: 20,
        });
        let json = serde_json::to_value(GradeReport::from(&outcome)).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["rejection"]["kind"], "output_quota");
    }

    #[test]
    fn test_format_result() {
        let now = Utc::now();
        let mut results = HashMap::new();
        results.insert("admin@test.com".to_string(), None);
        results.insert(
            "student@test.com".to_string(),
            Some(SubmissionHistoryItem {
                id: "course101::hw0::student@test.com::1".to_string(),
                short_id: "1".to_string(),
                course_id: "course101".to_string(),
                assignment_id: "hw0".to_string(),
                user: "student@test.com".to_string(),
                message: String::new(),
                max_points: 1.0,
                score: 1.0,
                grading_start_time: now,
            }),
        );
        let result = RegradeResult {
            request_id: Uuid::new_v4(),
            users: vec!["admin@test.com".to_string(), "student@test.com".to_string()],
            results,
            pending: 0,
            error: None,
            completed_at: now,
        };

        let text = format_result(&result);
        let lines: Vec<_> = text.lines().collect();
        assert!(lines[0].contains("2 users, 0 pending"));
        assert_eq!(lines[1], "  admin@test.com: not regraded");
        assert!(lines[2].starts_with("  student@test.com: 1 / 1"));
    }

    #[test]
    fn test_build_regrade_request() {
        let assignment: Assignment =
            serde_json::from_str(r#"{"id": "hw0", "course_id": "course101", "image": "img"}"#).unwrap();
        let request = build_regrade_request(assignment, vec!["*".to_string()], true, None, None);
        assert!(request.wait_for_completion);
        assert_eq!(request.selectors, vec!["*"]);
    }
}
