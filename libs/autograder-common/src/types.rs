use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// One grading unit: (course, assignment, user).
/// Fields are compared case-sensitively; normalization happens upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GradingTarget {
    pub course: String,
    pub assignment: String,
    pub user: String,
}

impl GradingTarget {
    pub fn new(course: impl Into<String>, assignment: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            course: course.into(),
            assignment: assignment.into(),
            user: user.into(),
        }
    }

    /// Lock key serializing every grading attempt for this target.
    pub fn lock_key(&self) -> String {
        format!("grade::{}", self)
    }

    /// Whether every field can name a single directory level
    pub fn is_path_safe(&self) -> bool {
        [&self.course, &self.assignment, &self.user]
            .into_iter()
            .all(|value| is_path_segment(value))
    }
}

/// A non-empty name that stays inside its parent directory when joined to it
pub fn is_path_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && !value.contains(['/', '\\', '\0'])
}

impl fmt::Display for GradingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.course, self.assignment, self.user)
    }
}

/// Caps how many graded submissions a user may make inside a sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubmissionLimit {
    pub max_attempts: u32,
    pub window_secs: i64,
}

/// Assignment definition as handed to the grading core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: String,
    pub course_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Grader image used by the container runner
    pub image: String,
    /// Command that runs the grader inside the sandbox
    #[serde(default = "default_grader_command")]
    pub grader_command: Vec<String>,
    /// Directory holding the grader files; the process runner uses it as cwd
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    /// Overrides the configured grading timeout
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub submission_limit: Option<SubmissionLimit>,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reject_late: bool,
}

fn default_grader_command() -> Vec<String> {
    vec!["bash".to_string(), "grader.sh".to_string()]
}

impl Assignment {
    pub fn full_id(&self) -> String {
        format!("{}::{}", self.course_id, self.id)
    }

    pub fn target(&self, user: &str) -> GradingTarget {
        GradingTarget::new(&self.course_id, &self.id, user)
    }
}

/// Score for one question, as reported by the grader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradedQuestion {
    pub name: String,
    pub max_points: f64,
    pub score: f64,
    #[serde(default)]
    pub message: String,
}

/// Structured grader output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradedAssignment {
    pub questions: Vec<GradedQuestion>,
}

impl GradedAssignment {
    pub fn score(&self) -> f64 {
        self.questions.iter().map(|q| q.score).sum()
    }

    pub fn max_points(&self) -> f64 {
        self.questions.iter().map(|q| q.max_points).sum()
    }

    /// Human readable report, one line per question
    pub fn report(&self) -> String {
        let mut lines = Vec::with_capacity(self.questions.len() + 1);
        lines.push(format!("Total: {} / {}", self.score(), self.max_points()));
        for question in &self.questions {
            let mut line = format!("  {}: {} / {}", question.name, question.score, question.max_points);
            if !question.message.is_empty() {
                line.push_str(&format!(" ({})", question.message));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// Metadata for one completed grading attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingInfo {
    pub id: String,
    pub short_id: String,
    pub course_id: String,
    pub assignment_id: String,
    pub user: String,
    pub message: String,
    pub max_points: f64,
    pub score: f64,
    pub grading_start_time: DateTime<Utc>,
    pub grading_end_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_user: Option<String>,
}

impl GradingInfo {
    pub fn to_history_item(&self) -> SubmissionHistoryItem {
        SubmissionHistoryItem {
            id: self.id.clone(),
            short_id: self.short_id.clone(),
            course_id: self.course_id.clone(),
            assignment_id: self.assignment_id.clone(),
            user: self.user.clone(),
            message: self.message.clone(),
            max_points: self.max_points,
            score: self.score,
            grading_start_time: self.grading_start_time,
        }
    }
}

/// Externally visible outcome of one grading attempt.
/// Immutable once produced; the scheduler only aggregates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionHistoryItem {
    pub id: String,
    pub short_id: String,
    pub course_id: String,
    pub assignment_id: String,
    pub user: String,
    pub message: String,
    pub max_points: f64,
    pub score: f64,
    pub grading_start_time: DateTime<Utc>,
}

/// Summary written next to the grader output and handed to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionSummary {
    pub id: String,
    pub message: String,
    pub max_points: f64,
    pub score: f64,
    pub question_count: usize,
}

/// What storage keeps for every graded submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub info: GradingInfo,
    pub summary: SubmissionSummary,
    /// gzip'd tar of the submission input directory
    #[serde(skip)]
    pub input_files_gzip: Vec<u8>,
    pub recorded_at: DateTime<Utc>,
}

/// Policy-driven refusal to grade. Not an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    MaxAttempts {
        max_attempts: u32,
        window_secs: i64,
        next_allowed: DateTime<Utc>,
    },
    LateSubmission {
        due_date: DateTime<Utc>,
    },
    OutputQuota {
        limit_bytes: usize,
        actual_bytes: usize,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::MaxAttempts { max_attempts, window_secs, next_allowed } => write!(
                f,
                "Reached the limit of {} submissions per {} seconds. Next submission allowed at {}.",
                max_attempts,
                window_secs,
                next_allowed.to_rfc3339()
            ),
            Rejection::LateSubmission { due_date } => {
                write!(f, "Submission arrived after the due date ({}).", due_date.to_rfc3339())
            }
            Rejection::OutputQuota { limit_bytes, actual_bytes } => write!(
                f,
                "Grader output of {} bytes exceeds the limit of {} bytes.",
                actual_bytes, limit_bytes
            ),
        }
    }
}

/// Regrade request as queued by the HTTP layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegradeRequest {
    pub id: Uuid,
    pub assignment: Assignment,
    /// Emails or role names; empty means every student
    #[serde(default)]
    pub selectors: Vec<String>,
    #[serde(default)]
    pub wait_for_completion: bool,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub after: Option<DateTime<Utc>>,
}

/// Regrade outcome as stored for the requester
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegradeResult {
    pub request_id: Uuid,
    pub users: Vec<String>,
    pub results: HashMap<String, Option<SubmissionHistoryItem>>,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}
