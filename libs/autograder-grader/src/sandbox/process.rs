use super::{
    classify, RawOutput, RunStatus, SandboxError, SandboxOutcome, SandboxRequest, SandboxRunner,
    ENV_GRADING_ID, ENV_INPUT_DIR, ENV_OUTPUT_DIR, ENV_USER,
};
use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Runs the grader as a direct child process.
///
/// No isolation beyond a timeout: meant for development and for hosts where
/// the grader already runs inside a container. The working directory is the
/// assignment's `source_dir` when set, otherwise the input directory.
#[derive(Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    fn name(&self) -> &'static str {
        "process"
    }

    #[instrument(skip_all, fields(grading_id = %request.grading_id))]
    async fn execute(
        &self,
        request: &SandboxRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        let (program, args) = request
            .assignment
            .grader_command
            .split_first()
            .ok_or_else(|| SandboxError::new("assignment has an empty grader command"))?;

        let cwd = request
            .assignment
            .source_dir
            .as_deref()
            .unwrap_or(request.input_dir);

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .env(ENV_INPUT_DIR, request.input_dir)
            .env(ENV_OUTPUT_DIR, request.output_dir)
            .env(ENV_USER, &request.target.user)
            .env(ENV_GRADING_ID, request.grading_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| SandboxError::new(format!("failed to start grader '{}': {}", program, e)))?;

        let start_time = Instant::now();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut stdout_bytes = Vec::new();
        let mut stderr_bytes = Vec::new();
        let mut stdout_chunk = [0u8; READ_CHUNK_BYTES];
        let mut stderr_chunk = [0u8; READ_CHUNK_BYTES];

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);

        // Read both pipes as they fill so a runaway grader is stopped at the quota
        let status = loop {
            if stdout_bytes.len() + stderr_bytes.len() > request.max_output_bytes {
                warn!(limit_bytes = request.max_output_bytes, "Grader output over quota, killed");
                break kill(&mut child).await;
            }

            if stdout.is_none() && stderr.is_none() {
                break tokio::select! {
                    _ = cancel.cancelled() => {
                        kill(&mut child).await;
                        RunStatus::Cancelled
                    }
                    _ = &mut deadline => {
                        warn!(timeout_ms = request.timeout.as_millis() as u64, "Grader timed out, killed");
                        kill(&mut child).await;
                        RunStatus::TimedOut
                    }
                    status = child.wait() => match status {
                        Ok(status) => RunStatus::Exited(exit_code(&status)),
                        Err(e) => {
                            return Err(SandboxError::with_output(
                                format!("failed to wait for grader: {}", e),
                                lossy(&stdout_bytes, &stderr_bytes),
                            ));
                        }
                    },
                };
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    kill(&mut child).await;
                    break RunStatus::Cancelled;
                }
                _ = &mut deadline => {
                    warn!(timeout_ms = request.timeout.as_millis() as u64, "Grader timed out, killed");
                    kill(&mut child).await;
                    break RunStatus::TimedOut;
                }
                read = read_some(&mut stdout, &mut stdout_chunk), if stdout.is_some() => {
                    match read {
                        Some(n) => stdout_bytes.extend_from_slice(&stdout_chunk[..n]),
                        None => stdout = None,
                    }
                }
                read = read_some(&mut stderr, &mut stderr_chunk), if stderr.is_some() => {
                    match read {
                        Some(n) => stderr_bytes.extend_from_slice(&stderr_chunk[..n]),
                        None => stderr = None,
                    }
                }
            }
        };

        let output = lossy(&stdout_bytes, &stderr_bytes);

        debug!(
            execution_time_ms = start_time.elapsed().as_millis() as u64,
            status = ?status,
            "Grader process finished"
        );

        classify(request, status, output).await
    }
}

const READ_CHUNK_BYTES: usize = 8192;

/// Next chunk from a pipe; `None` once it is closed or unreadable
async fn read_some<R: AsyncRead + Unpin>(pipe: &mut Option<R>, chunk: &mut [u8]) -> Option<usize> {
    let pipe = pipe.as_mut()?;
    match pipe.read(chunk).await {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(e) => {
            warn!(error = %e, "Failed to read grader output");
            None
        }
    }
}

/// Kill the grader and report how it ended
async fn kill(child: &mut Child) -> RunStatus {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill grader process");
    }
    match child.try_wait() {
        Ok(Some(status)) => RunStatus::Exited(exit_code(&status)),
        _ => RunStatus::Exited(-1),
    }
}

fn lossy(stdout: &[u8], stderr: &[u8]) -> RawOutput {
    RawOutput {
        stdout: String::from_utf8_lossy(stdout).into_owned(),
        stderr: String::from_utf8_lossy(stderr).into_owned(),
    }
}

fn exit_code(status: &ExitStatus) -> i64 {
    // Killed by a signal: report the shell convention 128 + signo
    status.code().map(i64::from).unwrap_or_else(|| signal_exit_code(status))
}

#[cfg(unix)]
fn signal_exit_code(status: &ExitStatus) -> i64 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map_or(-1, |signo| 128 + i64::from(signo))
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &ExitStatus) -> i64 {
    -1
}
