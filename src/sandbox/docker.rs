//! Containerized execution over the Docker Engine API.
//!
//! Each invocation runs in a fresh container: scratch directory bind-mounted
//! at `/app`, memory and CPU limits from `SandboxConfig`, allow-listed env
//! only, and a hard wall-clock timeout enforced by force-killing the
//! container. Containers are removed on every path, including timeout and
//! cancellation.
//!
//! The wait/kill/log lifecycle is driven through the `ContainerEngine`
//! trait so the timeout and cancellation invariants are testable without a
//! running engine.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{allow_listed_env, SandboxConfig};
use crate::errors::SandboxError;
use crate::models::{ExecutionResult, SandboxKind};

/// Output kept per stream; tracebacks live at the tail, so truncation drops
/// the head.
const OUTPUT_CAP: usize = 5000;

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// The running-container operations `drive_container` needs. One impl
/// talks to the Docker engine; tests substitute a scripted engine.
#[async_trait]
trait ContainerEngine: Send + Sync {
    async fn start(&self, name: &str) -> Result<(), SandboxError>;
    /// Resolves with the exit status once the container stops.
    async fn wait_for_exit(&self, name: &str) -> Result<i64, SandboxError>;
    async fn kill(&self, name: &str);
    async fn collect_logs(&self, name: &str) -> (String, String);
}

/// Handle to a reachable Docker engine.
#[derive(Clone)]
pub struct DockerSandbox {
    docker: Docker,
}

impl std::fmt::Debug for DockerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerSandbox").finish_non_exhaustive()
    }
}

impl DockerSandbox {
    /// Connect to the local engine and verify it responds. Probed once at
    /// startup; the capability is then passed by value to the executor.
    pub async fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::EngineUnavailable(e.to_string()))?;
        tokio::time::timeout(PROBE_TIMEOUT, docker.ping())
            .await
            .map_err(|_| SandboxError::EngineUnavailable("ping timed out".to_string()))?
            .map_err(|e| SandboxError::EngineUnavailable(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Pull the sandbox image if it is not present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), SandboxError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        tracing::info!(image, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| SandboxError::ImagePull {
                image: image.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Run `sh /app/run.sh` in a fresh container with the scratch directory
    /// mounted at `/app`. Returns a failed result (not an error) for
    /// non-zero exits, timeouts, and cancellation; `Err` means the engine
    /// itself misbehaved.
    pub async fn run(
        &self,
        scratch: &Path,
        config: &SandboxConfig,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        self.ensure_image(&config.image).await?;

        let name = format!("forgeflow-run-{}", Uuid::new_v4().simple());
        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), "rw,size=64m".to_string());

        let host_config = HostConfig {
            memory: Some(config.memory_bytes()),
            nano_cpus: Some(config.nano_cpus()),
            binds: Some(vec![format!("{}:/app", scratch.display())]),
            tmpfs: Some(tmpfs),
            network_mode: (!config.network).then(|| "none".to_string()),
            ..Default::default()
        };
        let container_config = Config {
            image: Some(config.image.clone()),
            cmd: Some(vec!["sh".to_string(), "/app/run.sh".to_string()]),
            working_dir: Some("/app".to_string()),
            env: Some(allow_listed_env(&config.env)),
            host_config: Some(host_config),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))?;

        let engine = BollardEngine {
            docker: self.docker.clone(),
        };
        let result = drive_container(&engine, &name, config, cancel).await;
        self.remove(&name).await;
        result
    }

    async fn remove(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(name, Some(options)).await {
            tracing::warn!(container = name, error = %e, "Failed to remove container");
        }
    }
}

struct BollardEngine {
    docker: Docker,
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn start(&self, name: &str) -> Result<(), SandboxError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))
    }

    async fn wait_for_exit(&self, name: &str) -> Result<i64, SandboxError> {
        let mut wait = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The wait endpoint reports non-zero exits as errors in some
            // engine versions; the exit status still arrives.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(other)) => Err(SandboxError::Container(other.to_string())),
            None => Err(SandboxError::Container(
                "wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn kill(&self, name: &str) {
        if let Err(e) = self
            .docker
            .kill_container(name, None::<KillContainerOptions<String>>)
            .await
        {
            tracing::warn!(container = name, error = %e, "Failed to kill container");
        }
    }

    async fn collect_logs(&self, name: &str) -> (String, String) {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(container = name, error = %e, "Failed reading container logs");
                    break;
                }
            }
        }
        (cap_output(&stdout), cap_output(&stderr))
    }
}

/// Start the container and wait for exit, timeout, or cancellation. The
/// container is force-killed before returning on the timeout and
/// cancellation paths; it is never left running.
async fn drive_container<E: ContainerEngine + ?Sized>(
    engine: &E,
    name: &str,
    config: &SandboxConfig,
    cancel: &CancellationToken,
) -> Result<ExecutionResult, SandboxError> {
    let started = Instant::now();
    engine.start(name).await?;
    let deadline = Duration::from_secs(config.timeout_secs);

    let status_code = tokio::select! {
        outcome = tokio::time::timeout(deadline, engine.wait_for_exit(name)) => match outcome {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                engine.kill(name).await;
                let (stdout, stderr) = engine.collect_logs(name).await;
                return Ok(ExecutionResult {
                    success: false,
                    stdout,
                    stderr: format!(
                        "TimeoutError: Workflow execution exceeded {} seconds\n{}",
                        config.timeout_secs, stderr
                    ),
                    error: Some(format!(
                        "Execution timed out after {} seconds",
                        config.timeout_secs
                    )),
                    execution_time: started.elapsed().as_secs_f64(),
                    sandbox: SandboxKind::Docker,
                });
            }
        },
        _ = cancel.cancelled() => {
            engine.kill(name).await;
            return Ok(ExecutionResult {
                success: false,
                stdout: String::new(),
                stderr: String::new(),
                error: Some("Execution cancelled".to_string()),
                execution_time: started.elapsed().as_secs_f64(),
                sandbox: SandboxKind::Docker,
            });
        }
    };

    let (stdout, stderr) = engine.collect_logs(name).await;
    let success = status_code == 0;
    let error = if success {
        None
    } else {
        Some(
            stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("non-zero exit status")
                .to_string(),
        )
    };

    Ok(ExecutionResult {
        success,
        stdout,
        stderr,
        error,
        execution_time: started.elapsed().as_secs_f64(),
        sandbox: SandboxKind::Docker,
    })
}

/// Keep the tail of an output stream within the cap.
fn cap_output(s: &str) -> String {
    if s.len() <= OUTPUT_CAP {
        return s.to_string();
    }
    let mut start = s.len() - OUTPUT_CAP;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    format!("... [truncated] ...\n{}", &s[start..])
}
