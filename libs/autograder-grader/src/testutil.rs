//! Shared fixtures for grader and regrade tests.

use crate::evaluator;
use crate::grader::{Grader, GraderSettings};
use crate::sandbox::{
    classify, RawOutput, RunStatus, SandboxError, SandboxOutcome, SandboxRequest, SandboxRunner,
};
use crate::store::{MemoryStore, SubmissionStore};
use async_trait::async_trait;
use autograder_common::types::Assignment;
use autograder_jobs::LockManager;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StubBehavior {
    /// One question worth 1 point, earned when `answer.txt` holds "42"
    Grade,
    Exit(i64),
    /// Blows the output quota
    Loud,
    /// Infrastructure failure after some output
    Error,
}

/// Entry and exit of one sandbox call
#[derive(Debug, Clone)]
pub struct Span {
    pub user: String,
    pub input_dir: PathBuf,
    pub entered: Instant,
    pub exited: Instant,
}

pub struct StubRunner {
    behavior: StubBehavior,
    delay: Duration,
    calls: AtomicUsize,
    spans: Mutex<Vec<Span>>,
}

impl StubRunner {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            spans: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxRunner for StubRunner {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn execute(
        &self,
        request: &SandboxRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let entered = Instant::now();

        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.delay) => false,
        };

        let (status, output) = if cancelled {
            (RunStatus::Cancelled, RawOutput::default())
        } else {
            match self.behavior {
                StubBehavior::Grade => {
                    let answer = tokio::fs::read_to_string(request.input_dir.join("answer.txt"))
                        .await
                        .unwrap_or_default();
                    let score = if answer.trim() == "42" { 1 } else { 0 };
                    let result = format!(
                        r#"{{"questions": [{{"name": "Q1", "max_points": 1, "score": {}}}]}}"#,
                        score
                    );
                    tokio::fs::write(evaluator::result_path(request.output_dir), result)
                        .await
                        .unwrap();
                    (
                        RunStatus::Exited(0),
                        RawOutput {
                            stdout: format!("graded {}", request.target.user),
                            stderr: String::new(),
                        },
                    )
                }
                StubBehavior::Exit(code) => (RunStatus::Exited(code), RawOutput::default()),
                StubBehavior::Loud => (
                    RunStatus::Exited(0),
                    RawOutput {
                        stdout: "x".repeat(request.max_output_bytes + 1),
                        stderr: String::new(),
                    },
                ),
                StubBehavior::Error => {
                    self.record(request, entered);
                    return Err(SandboxError::with_output(
                        "sandbox exploded",
                        RawOutput {
                            stdout: "partial output".to_string(),
                            stderr: String::new(),
                        },
                    ));
                }
            }
        };

        self.record(request, entered);
        classify(request, status, output).await
    }
}

impl StubRunner {
    fn record(&self, request: &SandboxRequest<'_>, entered: Instant) {
        self.spans.lock().unwrap().push(Span {
            user: request.target.user.clone(),
            input_dir: request.input_dir.to_path_buf(),
            entered,
            exited: Instant::now(),
        });
    }
}

pub struct Fixture {
    pub grader: Arc<Grader>,
    pub store: Arc<MemoryStore>,
    pub work_dir: TempDir,
}

pub fn fixture(runner: Arc<StubRunner>) -> Fixture {
    let work_dir = tempfile::tempdir().unwrap();
    let settings = GraderSettings {
        submissions_dir: work_dir.path().join("submissions"),
        temp_dir: work_dir.path().join("temp"),
        grading_timeout: Duration::from_secs(10),
        max_output_bytes: 1024,
        regrade_pool_size: 2,
        leave_temp_dirs: false,
        use_fake_submissions_dir: false,
    };

    let store = Arc::new(MemoryStore::new());
    let grader = Arc::new(Grader::new(
        Arc::new(LockManager::new()),
        runner,
        store.clone() as Arc<dyn SubmissionStore>,
        settings,
    ));

    Fixture {
        grader,
        store,
        work_dir,
    }
}

pub fn assignment() -> Assignment {
    serde_json::from_str(r#"{"id": "hw0", "course_id": "course101", "image": "autograder/hw0"}"#)
        .unwrap()
}

/// Submission directory whose `answer.txt` holds `answer`
pub fn submission(answer: &str) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("answer.txt"), answer).unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/notes.md"), "work shown").unwrap();
    dir
}
