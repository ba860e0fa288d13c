//! Candidate execution.
//!
//! `SandboxExecutor` stages the generated program into a throwaway scratch
//! directory and runs it in Docker when an engine is reachable, falling
//! back to static analysis otherwise. The fallback is silent at the API
//! level: callers always get an `ExecutionResult`, and `SandboxKind` on the
//! result records which strategy actually ran.

mod docker;
mod static_check;

pub use docker::DockerSandbox;
pub use static_check::run_static_analysis;

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::config::SandboxConfig;
use crate::errors::SandboxError;
use crate::models::{ExecutionResult, GeneratedCode, SandboxKind};

/// Bootstrap script run inside the container. Installs the HTTP clients the
/// generated code is allowed to use, then runs the candidate.
const RUN_SCRIPT: &str = "#!/bin/sh\nset -e\npip install --quiet httpx websockets aiohttp\nexec python workflow.py\n";

/// Executes candidate programs, behaviorally when possible.
#[derive(Debug)]
pub struct SandboxExecutor {
    docker: Option<DockerSandbox>,
    config: SandboxConfig,
}

impl SandboxExecutor {
    /// Probe the Docker engine once and fix the execution strategy for the
    /// process lifetime.
    pub async fn probe(config: SandboxConfig) -> Self {
        let docker = match DockerSandbox::connect().await {
            Ok(sandbox) => {
                tracing::info!(image = %config.image, "Docker engine available, using containerized execution");
                Some(sandbox)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Docker engine unavailable, falling back to static analysis");
                None
            }
        };
        Self { docker, config }
    }

    /// Build an executor with a known capability. Used by tests and by
    /// callers that probed separately.
    pub fn with_capability(docker: Option<DockerSandbox>, config: SandboxConfig) -> Self {
        Self { docker, config }
    }

    pub fn docker_available(&self) -> bool {
        self.docker.is_some()
    }

    pub fn kind(&self) -> SandboxKind {
        if self.docker.is_some() {
            SandboxKind::Docker
        } else {
            SandboxKind::StaticAnalysis
        }
    }

    /// Execute the candidate. Behavioral and structural failures both come
    /// back as failed results; `Err` is reserved for being unable to stage
    /// the candidate at all.
    pub async fn execute(
        &self,
        code: &GeneratedCode,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        let docker = match &self.docker {
            Some(docker) => docker,
            None => return Ok(run_static_analysis(code)),
        };

        let scratch = tempfile::tempdir().map_err(SandboxError::ScratchDir)?;
        stage_candidate(scratch.path(), code)?;

        match docker.run(scratch.path(), &self.config, cancel).await {
            Ok(result) => Ok(result),
            Err(e) => {
                // A container-level fault mid-run degrades the same way a
                // missing engine does, so the pipeline still gets a verdict.
                tracing::warn!(error = %e, "Containerized execution failed, degrading to static analysis");
                Ok(run_static_analysis(code))
            }
        }
    }
}

/// Write the candidate program and its runner into the scratch directory.
fn stage_candidate(scratch: &Path, code: &GeneratedCode) -> Result<(), SandboxError> {
    write_file(scratch, "workflow.py", &code.source)?;
    for (rel_path, content) in &code.aux_files {
        write_file(scratch, rel_path, content)?;
    }
    write_file(scratch, "run.sh", RUN_SCRIPT)?;
    Ok(())
}

fn write_file(scratch: &Path, rel_path: &str, content: &str) -> Result<(), SandboxError> {
    // Aux file paths come from a collaborator; refuse anything that would
    // escape the scratch directory.
    if rel_path.contains("..") || Path::new(rel_path).is_absolute() {
        return Err(SandboxError::FileWrite {
            path: rel_path.into(),
            source: std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "path escapes scratch directory",
            ),
        });
    }
    let path = scratch.join(rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SandboxError::FileWrite {
            path: path.clone(),
            source: e,
        })?;
    }
    std::fs::write(&path, content).map_err(|e| SandboxError::FileWrite { path, source: e })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn candidate() -> GeneratedCode {
        let mut aux_files = HashMap::new();
        aux_files.insert(
            "clients/slack.py".to_string(),
            "def post(text):\n    pass\n".to_string(),
        );
        GeneratedCode {
            source: "def main():\n    pass\n".to_string(),
            aux_files,
        }
    }

    #[test]
    fn test_stage_candidate_writes_all_files() {
        let dir = tempfile::tempdir().unwrap();
        stage_candidate(dir.path(), &candidate()).unwrap();

        let main = std::fs::read_to_string(dir.path().join("workflow.py")).unwrap();
        assert!(main.contains("def main"));
        assert!(dir.path().join("clients/slack.py").exists());
        let runner = std::fs::read_to_string(dir.path().join("run.sh")).unwrap();
        assert!(runner.contains("python workflow.py"));
        assert!(runner.contains("pip install"));
    }

    #[test]
    fn test_stage_candidate_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let mut code = candidate();
        code.aux_files
            .insert("../evil.py".to_string(), "x = 1".to_string());
        assert!(stage_candidate(dir.path(), &code).is_err());
    }

    #[tokio::test]
    async fn test_execute_without_docker_uses_static_analysis() {
        let executor = SandboxExecutor::with_capability(None, SandboxConfig::default());
        assert!(!executor.docker_available());
        assert_eq!(executor.kind(), SandboxKind::StaticAnalysis);

        let result = executor
            .execute(&candidate(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.sandbox, SandboxKind::StaticAnalysis);
    }

    #[tokio::test]
    async fn test_execute_surfaces_syntax_failure_without_docker() {
        let executor = SandboxExecutor::with_capability(None, SandboxConfig::default());
        let code = GeneratedCode {
            source: "def broken(:\n".to_string(),
            aux_files: HashMap::new(),
        };
        let result = executor
            .execute(&code, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.stderr.contains("SyntaxError"));
    }
}
