/// Docker-based sandbox
///
/// **Execution Rules:**
/// 1. Pulls the assignment's grader image if not present
/// 2. Creates a container with security constraints:
///    - Network disabled
///    - CPU/memory limits enforced
///    - Submission input mounted read-only, output mounted read-write
/// 3. Streams stdout/stderr, stopping early once the output quota is blown
/// 4. Kills the container on timeout or cancellation
/// 5. Removes the container on every exit path

use super::{
    classify, RawOutput, RunStatus, SandboxError, SandboxOutcome, SandboxRequest, SandboxRunner,
    ENV_GRADING_ID, ENV_INPUT_DIR, ENV_OUTPUT_DIR, ENV_USER,
};
use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const CONTAINER_INPUT_DIR: &str = "/autograder/input";
const CONTAINER_OUTPUT_DIR: &str = "/autograder/output";

const DEFAULT_MEMORY_LIMIT_BYTES: i64 = 512 * 1024 * 1024;
const DEFAULT_NANO_CPUS: i64 = 1_000_000_000;

/// Container cleanup guard - guarantees container removal on drop,
/// including panics and cancellation
struct ContainerGuard<'a> {
    docker: &'a Docker,
    container_id: String,
}

impl<'a> ContainerGuard<'a> {
    fn new(docker: &'a Docker, container_id: String) -> Self {
        Self { docker, container_id }
    }
}

impl Drop for ContainerGuard<'_> {
    fn drop(&mut self) {
        // Drop cannot await; removal runs detached
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };

            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to clean up container");
            }
        });
    }
}

pub struct DockerRunner {
    docker: Docker,
    memory_limit_bytes: i64,
    nano_cpus: i64,
}

impl DockerRunner {
    pub fn new() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            nano_cpus: DEFAULT_NANO_CPUS,
        })
    }

    /// Verify the image exists locally, pulling it on a cache miss
    async fn ensure_image(&self, image: &str) -> anyhow::Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %image, "Image cache miss, pulling");

        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }

        info!(image = %image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, request: &SandboxRequest<'_>) -> Result<Config<String>, SandboxError> {
        let binds = vec![
            bind(request.input_dir, CONTAINER_INPUT_DIR, true)?,
            bind(request.output_dir, CONTAINER_OUTPUT_DIR, false)?,
        ];

        Ok(Config {
            image: Some(request.assignment.image.clone()),
            cmd: Some(request.assignment.grader_command.clone()),
            env: Some(vec![
                format!("{}={}", ENV_INPUT_DIR, CONTAINER_INPUT_DIR),
                format!("{}={}", ENV_OUTPUT_DIR, CONTAINER_OUTPUT_DIR),
                format!("{}={}", ENV_USER, request.target.user),
                format!("{}={}", ENV_GRADING_ID, request.grading_id),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                binds: Some(binds),
                memory: Some(self.memory_limit_bytes),
                nano_cpus: Some(self.nano_cpus),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    /// Stream logs into `output` until the container stops or the quota is
    /// exceeded, then collect the exit code
    async fn collect(&self, container_id: &str, max_output_bytes: usize, output: &mut RawOutput) -> Option<i64> {

        let logs_options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            ..Default::default()
        });

        let mut logs_stream = self.docker.logs(container_id, logs_options);
        while let Some(chunk) = logs_stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    output.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    output.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(container_id = %container_id, error = %e, "Error reading container logs");
                    break;
                }
            }

            if output.len() > max_output_bytes {
                // Already over quota; the caller kills the container
                return None;
            }
        }

        let wait_options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait_stream = self.docker.wait_container(container_id, Some(wait_options));

        let exit_code = match wait_stream.next().await {
            Some(Ok(response)) => Some(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
            Some(Err(e)) => {
                warn!(container_id = %container_id, error = %e, "Failed to get container exit code");
                None
            }
            None => None,
        };

        exit_code
    }

    async fn kill(&self, container_id: &str) {
        if let Err(e) = self
            .docker
            .kill_container(container_id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container_id = %container_id, error = %e, "Failed to kill container");
        }
    }
}

fn bind(host: &Path, container: &str, read_only: bool) -> Result<String, SandboxError> {
    let host = host
        .canonicalize()
        .map_err(|e| SandboxError::new(format!("cannot mount {}: {}", host.display(), e)))?;
    let mode = if read_only { "ro" } else { "rw" };
    Ok(format!("{}:{}:{}", host.display(), container, mode))
}

#[async_trait]
impl SandboxRunner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip_all, fields(grading_id = %request.grading_id, image = %request.assignment.image))]
    async fn execute(
        &self,
        request: &SandboxRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome, SandboxError> {
        let image = &request.assignment.image;
        self.ensure_image(image)
            .await
            .map_err(|e| SandboxError::new(format!("failed to ensure image '{}': {:#}", image, e)))?;

        let config = self.container_config(request)?;
        let container_name = format!("autograder-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| SandboxError::new(format!("failed to create container: {}", e)))?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard::new(&self.docker, container_id.clone());

        let start_time = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::new(format!("failed to start container: {}", e)))?;

        let mut output = RawOutput::default();
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                self.kill(&container_id).await;
                RunStatus::Cancelled
            }
            result = tokio::time::timeout(
                request.timeout,
                self.collect(&container_id, request.max_output_bytes, &mut output),
            ) => {
                match result {
                    Err(_) => {
                        warn!(timeout_ms = request.timeout.as_millis() as u64, "Grading timed out, killing container");
                        self.kill(&container_id).await;
                        RunStatus::TimedOut
                    }
                    Ok(Some(code)) => RunStatus::Exited(code),
                    Ok(None) => {
                        self.kill(&container_id).await;
                        if output.len() > request.max_output_bytes {
                            // classify turns this into an output quota rejection
                            RunStatus::Exited(-1)
                        } else {
                            return Err(SandboxError::with_output("no exit code captured from container", output));
                        }
                    }
                }
            }
        };

        debug!(
            execution_time_ms = start_time.elapsed().as_millis() as u64,
            status = ?status,
            "Container finished"
        );

        classify(request, status, output).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autograder_common::types::Assignment;
    use std::time::Duration;

    #[test]
    fn test_bind_requires_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ro = bind(dir.path(), CONTAINER_INPUT_DIR, true).unwrap();
        assert!(ro.ends_with(":/autograder/input:ro"));

        let missing = dir.path().join("missing");
        assert!(bind(&missing, CONTAINER_OUTPUT_DIR, false).is_err());
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn test_container_grading() {
        let staging = tempfile::tempdir().unwrap();
        let input_dir = staging.path().join("input");
        let output_dir = staging.path().join("output");
        std::fs::create_dir_all(&input_dir).unwrap();
        std::fs::create_dir_all(&output_dir).unwrap();

        let assignment: Assignment = serde_json::from_value(serde_json::json!({
            "id": "hw0",
            "course_id": "course101",
            "image": "alpine:3.19",
            "grader_command": ["sh", "-c",
                "echo '{\"questions\": [{\"name\": \"Q1\", \"max_points\": 1, \"score\": 1}]}' > $AUTOGRADER_OUTPUT_DIR/result.json"]
        }))
        .unwrap();
        let target = assignment.target("student@test.com");
        let request = SandboxRequest {
            assignment: &assignment,
            target: &target,
            grading_id: "course101::hw0::student@test.com::1",
            input_dir: &input_dir,
            output_dir: &output_dir,
            timeout: Duration::from_secs(60),
            max_output_bytes: 1024,
        };

        let runner = DockerRunner::new().unwrap();
        match runner.execute(&request, &CancellationToken::new()).await.unwrap() {
            SandboxOutcome::Completed { graded, .. } => assert_eq!(graded.score(), 1.0),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
