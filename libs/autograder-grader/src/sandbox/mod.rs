/// Sandbox Runner - Abstraction for Grader Execution
///
/// **Core Responsibility:**
/// Run an assignment's grader against one staged submission and report what
/// happened.
///
/// **Boundary:**
/// - Runners know HOW to execute (container, child process)
/// - Runners do NOT persist anything
/// - Scoring is read from the grader's own output by the evaluator
///
/// Outcomes are split three ways: a clean run yields a graded assignment, a
/// policy refusal yields a `Rejection`, and a grader that misbehaves (non-zero
/// exit, timeout) yields a soft failure. Only infrastructure problems are
/// errors.

pub mod docker;
pub mod process;

use crate::evaluator;
use async_trait::async_trait;
use autograder_common::types::{Assignment, GradedAssignment, GradingTarget, Rejection};
use autograder_common::Config;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use docker::DockerRunner;
pub use process::ProcessRunner;

/// Environment variables every grader sees
pub const ENV_INPUT_DIR: &str = "AUTOGRADER_INPUT_DIR";
pub const ENV_OUTPUT_DIR: &str = "AUTOGRADER_OUTPUT_DIR";
pub const ENV_USER: &str = "AUTOGRADER_USER";
pub const ENV_GRADING_ID: &str = "AUTOGRADER_GRADING_ID";

/// One staged submission, ready to run
#[derive(Debug, Clone)]
pub struct SandboxRequest<'a> {
    pub assignment: &'a Assignment,
    pub target: &'a GradingTarget,
    pub grading_id: &'a str,
    pub input_dir: &'a Path,
    pub output_dir: &'a Path,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

/// Console output captured from the grader
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn len(&self) -> usize {
        self.stdout.len() + self.stderr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// stdout followed by stderr, for reports
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SandboxOutcome {
    Completed {
        graded: GradedAssignment,
        output: RawOutput,
    },
    Rejected(Rejection),
    SoftFailure {
        message: String,
        output: RawOutput,
    },
}

/// Infrastructure failure, with whatever output was captured before it
#[derive(Debug, Error)]
#[error("{message}")]
pub struct SandboxError {
    pub message: String,
    pub output: RawOutput,
}

impl SandboxError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: RawOutput::default(),
        }
    }

    pub fn with_output(message: impl Into<String>, output: RawOutput) -> Self {
        Self {
            message: message.into(),
            output,
        }
    }
}

#[async_trait]
pub trait SandboxRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the grader. Implementations must stop promptly once `cancel` fires.
    async fn execute(
        &self,
        request: &SandboxRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError>;
}

/// How a grader run ended, before looking at its output files
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RunStatus {
    Exited(i64),
    TimedOut,
    Cancelled,
}

/// Shared classification of a finished run
pub(crate) async fn classify(
    request: &SandboxRequest<'_>,
    status: RunStatus,
    output: RawOutput,
) -> Result<SandboxOutcome, SandboxError> {
    if output.len() > request.max_output_bytes {
        warn!(
            target_id = %request.target,
            limit_bytes = request.max_output_bytes,
            actual_bytes = output.len(),
            "Grader output exceeded quota"
        );
        return Ok(SandboxOutcome::Rejected(Rejection::OutputQuota {
            limit_bytes: request.max_output_bytes,
            actual_bytes: output.len(),
        }));
    }

    match status {
        RunStatus::Cancelled => Err(SandboxError::with_output("grading was cancelled", output)),
        RunStatus::TimedOut => Ok(SandboxOutcome::SoftFailure {
            message: format!(
                "Grading timed out after {}ms",
                request.timeout.as_millis()
            ),
            output,
        }),
        RunStatus::Exited(code) if code != 0 => {
            let mut message = format!("Grader exited with code {}", code);
            if code == 137 {
                message.push_str(" (killed: likely exceeded the memory limit)");
            } else if code == 139 {
                message.push_str(" (segmentation fault)");
            }
            Ok(SandboxOutcome::SoftFailure { message, output })
        }
        RunStatus::Exited(_) => match evaluator::read_graded_output(request.output_dir).await {
            Ok(graded) => Ok(SandboxOutcome::Completed { graded, output }),
            Err(e) => Err(SandboxError::with_output(e.to_string(), output)),
        },
    }
}

/// Pick the runner named by configuration
pub fn runner_from_config(config: &Config) -> anyhow::Result<Arc<dyn SandboxRunner>> {
    let runner: Arc<dyn SandboxRunner> = if config.docker_disable {
        Arc::new(ProcessRunner::new())
    } else {
        Arc::new(DockerRunner::new()?)
    };

    info!(runner = runner.name(), "Sandbox runner selected");
    Ok(runner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> Assignment {
        serde_json::from_str(r#"{"id": "hw0", "course_id": "course101", "image": "img"}"#).unwrap()
    }

    fn output(len: usize) -> RawOutput {
        RawOutput {
            stdout: "x".repeat(len),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_raw_output_combined() {
        let both = RawOutput {
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert_eq!(both.combined(), "out\nerr");
        assert_eq!(both.len(), 6);
        assert!(RawOutput::default().is_empty());
    }

    #[tokio::test]
    async fn test_classify_outcomes() {
        let dir = tempfile::tempdir().unwrap();
        let assignment = assignment();
        let target = assignment.target("alice");
        let request = SandboxRequest {
            assignment: &assignment,
            target: &target,
            grading_id: "course101::hw0::alice::1",
            input_dir: dir.path(),
            output_dir: dir.path(),
            timeout: Duration::from_millis(1500),
            max_output_bytes: 10,
        };

        let over = classify(&request, RunStatus::Exited(0), output(11)).await.unwrap();
        assert!(matches!(over, SandboxOutcome::Rejected(Rejection::OutputQuota { actual_bytes: 11, .. })));

        match classify(&request, RunStatus::TimedOut, output(1)).await.unwrap() {
            SandboxOutcome::SoftFailure { message, .. } => assert!(message.contains("1500ms")),
            other => panic!("unexpected outcome {:?}", other),
        }

        match classify(&request, RunStatus::Exited(137), output(0)).await.unwrap() {
            SandboxOutcome::SoftFailure { message, .. } => assert!(message.contains("memory limit")),
            other => panic!("unexpected outcome {:?}", other),
        }

        let cancelled = classify(&request, RunStatus::Cancelled, output(3)).await.unwrap_err();
        assert_eq!(cancelled.output.stdout, "xxx");

        let missing = classify(&request, RunStatus::Exited(0), output(0)).await.unwrap_err();
        assert!(missing.message.contains("result.json"));

        tokio::fs::write(
            evaluator::result_path(dir.path()),
            r#"{"questions": [{"name": "Q1", "max_points": 1, "score": 1}]}"#,
        )
        .await
        .unwrap();
        match classify(&request, RunStatus::Exited(0), output(2)).await.unwrap() {
            SandboxOutcome::Completed { graded, output } => {
                assert_eq!(graded.score(), 1.0);
                assert_eq!(output.stdout, "xx");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
