/// Grader Output Evaluator
///
/// **Core Responsibility:**
/// Turn what a grader left in its output directory into a scored
/// `GradedAssignment`, and derive the summary stored next to it.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or child processes
/// - Knows nothing about storage
/// - Runners call it after the grader exits cleanly; a missing or invalid
///   result file is an infrastructure failure, not a score of zero

use autograder_common::types::{GradedAssignment, GradingInfo, SubmissionSummary};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File the grader writes into its output directory
pub const RESULT_FILE: &str = "result.json";

/// File the grading core writes after a successful run
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("grader did not produce {path}: {source}")]
    Missing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("grader output {path} is not valid: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("question '{question}' has an invalid score: {reason}")]
    InvalidScore { question: String, reason: String },
}

pub fn result_path(output_dir: &Path) -> PathBuf {
    output_dir.join(RESULT_FILE)
}

/// Read and validate `result.json` from a finished grader run
pub async fn read_graded_output(output_dir: &Path) -> Result<GradedAssignment, EvaluationError> {
    let path = result_path(output_dir);
    let raw = tokio::fs::read(&path)
        .await
        .map_err(|source| EvaluationError::Missing { path: path.clone(), source })?;

    let graded: GradedAssignment = serde_json::from_slice(&raw)
        .map_err(|source| EvaluationError::Malformed { path, source })?;

    validate(&graded)?;
    Ok(graded)
}

/// Scores must be finite, non-negative and never above the question maximum
pub fn validate(graded: &GradedAssignment) -> Result<(), EvaluationError> {
    for question in &graded.questions {
        let invalid = |reason: &str| EvaluationError::InvalidScore {
            question: question.name.clone(),
            reason: reason.to_string(),
        };

        if !question.score.is_finite() || !question.max_points.is_finite() {
            return Err(invalid("not a finite number"));
        }
        if question.score < 0.0 || question.max_points < 0.0 {
            return Err(invalid("negative"));
        }
        if question.score > question.max_points {
            return Err(invalid("score exceeds max points"));
        }
    }
    Ok(())
}

pub fn summarize(info: &GradingInfo, graded: &GradedAssignment) -> SubmissionSummary {
    SubmissionSummary {
        id: info.id.clone(),
        message: info.message.clone(),
        max_points: graded.max_points(),
        score: graded.score(),
        question_count: graded.questions.len(),
    }
}
