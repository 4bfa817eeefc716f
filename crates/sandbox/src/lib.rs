//! capibara_sandbox
//!
//! Ephemeral, resource-capped Docker execution of a generated script.
//! A run stages a workspace directory, launches a locked-down container,
//! waits on it with a wall-clock bound, collects logs and resource usage,
//! and tears the container and workspace down on every exit path -
//! success, failure, timeout, or cancellation.

use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StatsOptions, WaitContainerOptions,
};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("docker connection failed: {0}")]
    Connect(#[source] bollard::errors::Error),
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("workspace io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("execution cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: String,
    pub cpu_seconds: u32,
    pub memory_mb: u32,
    pub wall_seconds: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub timed_out: bool,
    pub cpu_time_ms: u64,
    pub memory_peak_mb: u64,
    pub execution_time_ms: u64,
    pub resource_limit_exceeded: bool,
}

fn image_for(language: &str) -> Result<&'static str, SandboxError> {
    match language {
        "python" => Ok("python:3.11-slim"),
        "javascript" => Ok("node:18-slim"),
        "bash" => Ok("alpine:latest"),
        "powershell" => Ok("mcr.microsoft.com/powershell:latest"),
        other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
    }
}

fn extension_for(language: &str) -> &'static str {
    match language {
        "python" => "py",
        "javascript" => "js",
        "bash" => "sh",
        "powershell" => "ps1",
        _ => "txt",
    }
}

fn command_for(language: &str) -> Vec<String> {
    match language {
        "python" => vec!["python".into(), "/workspace/script.py".into()],
        "javascript" => vec!["node".into(), "/workspace/script.js".into()],
        "bash" => vec!["/bin/sh".into(), "/workspace/script.sh".into()],
        "powershell" => vec!["pwsh".into(), "/workspace/script.ps1".into()],
        _ => vec![],
    }
}

/// One-shot, self-cleaning runner. Created per execution; `Docker` itself
/// is cheap to clone/reconnect so no long-lived client is cached here.
pub struct SandboxRunner {
    docker: Docker,
}

impl SandboxRunner {
    pub fn connect() -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults().map_err(SandboxError::Connect)?;
        Ok(Self { docker })
    }

    pub async fn health_probe(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    pub async fn execute(&self, request: &ExecutionRequest) -> Result<ExecutionReport, SandboxError> {
        self.execute_cancellable(request, None).await
    }

    /// Same as `execute`, but also races the container wait against a
    /// cancellation signal. On cancellation the container is killed and
    /// removed just as on a timeout, and `SandboxError::Cancelled` is
    /// returned instead of a report - teardown still runs on this path.
    pub async fn execute_cancellable(
        &self,
        request: &ExecutionRequest,
        cancel: Option<&tokio::sync::Notify>,
    ) -> Result<ExecutionReport, SandboxError> {
        let started = Instant::now();
        let workspace = stage_workspace(request).await?;
        let container_name = format!("capibara-{}", Uuid::new_v4());

        let created = self.create_container(&container_name, request, &workspace).await;
        let container_id = match created {
            Ok(id) => id,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&workspace).await;
                return Err(e);
            }
        };

        let result = self.run_and_collect(&container_id, request, cancel).await;

        self.teardown(&container_id, &workspace).await;

        let mut report = result?;
        report.execution_time_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn create_container(
        &self,
        name: &str,
        request: &ExecutionRequest,
        workspace: &PathBuf,
    ) -> Result<String, SandboxError> {
        let image = image_for(&request.language)?;

        let host_config = HostConfig {
            mounts: Some(vec![Mount {
                target: Some("/workspace".to_string()),
                source: Some(workspace.to_string_lossy().to_string()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(true),
                ..Default::default()
            }]),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            network_mode: Some("none".to_string()),
            readonly_rootfs: Some(true),
            memory: Some(i64::from(request.memory_mb) * 1024 * 1024),
            memory_swap: Some(i64::from(request.memory_mb) * 1024 * 1024),
            cpu_period: Some(100_000),
            cpu_quota: Some(i64::from(request.cpu_seconds) * 100_000),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            working_dir: Some("/workspace".to_string()),
            user: Some("nobody".to_string()),
            env: Some(vec!["PYTHONUNBUFFERED=1".to_string()]),
            cmd: Some(command_for(&request.language)),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let created = self.docker.create_container(Some(options), config).await?;
        self.docker
            .start_container::<String>(&created.id, None)
            .await?;
        Ok(created.id)
    }

    async fn run_and_collect(
        &self,
        container_id: &str,
        request: &ExecutionRequest,
        cancel: Option<&tokio::sync::Notify>,
    ) -> Result<ExecutionReport, SandboxError> {
        let bounded_wait = tokio::time::timeout(
            Duration::from_secs(u64::from(request.wall_seconds)),
            self.wait_for_exit(container_id),
        );

        let outcome = match cancel {
            Some(notify) => tokio::select! {
                wait = bounded_wait => Ok(wait),
                _ = notify.notified() => Err(()),
            },
            None => Ok(bounded_wait.await),
        };

        let wait = match outcome {
            Ok(wait) => wait,
            Err(()) => {
                let _ = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>)
                    .await;
                return Err(SandboxError::Cancelled);
            }
        };

        let (exit_code, timed_out) = match wait {
            Ok(Ok(code)) => (code, false),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                let _ = self
                    .docker
                    .kill_container(container_id, None::<KillContainerOptions<String>>)
                    .await;
                (124, true)
            }
        };

        let (stdout, stderr) = self.collect_logs(container_id).await?;
        let (cpu_time_ms, memory_peak_mb) = self.collect_stats(container_id).await;

        let resource_limit_exceeded =
            memory_peak_mb > u64::from(request.memory_mb) || cpu_time_ms > u64::from(request.cpu_seconds) * 1000;

        Ok(ExecutionReport {
            stdout,
            stderr,
            exit_code,
            timed_out,
            cpu_time_ms,
            memory_peak_mb,
            execution_time_ms: 0,
            resource_limit_exceeded,
        })
    }

    async fn wait_for_exit(&self, container_id: &str) -> Result<i64, SandboxError> {
        let mut stream = self.docker.wait_container(
            container_id,
            None::<WaitContainerOptions<String>>,
        );
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(SandboxError::Docker(e)),
            None => Ok(0),
        }
    }

    async fn collect_logs(&self, container_id: &str) -> Result<(String, String), SandboxError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_id, Some(options));
        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => stdout.push_str(&String::from_utf8_lossy(&message)),
                Ok(LogOutput::StdErr { message }) => stderr.push_str(&String::from_utf8_lossy(&message)),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        Ok((stdout, stderr))
    }

    async fn collect_stats(&self, container_id: &str) -> (u64, u64) {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(container_id, Some(options));
        let Some(Ok(stats)) = stream.next().await else {
            return (0, 0);
        };

        let cpu_delta = stats
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(stats.precpu_stats.cpu_usage.total_usage);
        let system_delta = stats
            .cpu_stats
            .system_cpu_usage
            .unwrap_or(0)
            .saturating_sub(stats.precpu_stats.system_cpu_usage.unwrap_or(0));
        let num_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1);
        let cpu_time_ms = if system_delta > 0 {
            (cpu_delta as f64 / system_delta as f64) * num_cpus as f64 * 1000.0
        } else {
            0.0
        } as u64;

        let memory_bytes = stats.memory_stats.usage.unwrap_or(0);
        let memory_peak_mb = memory_bytes / (1024 * 1024);

        (cpu_time_ms, memory_peak_mb)
    }

    async fn teardown(&self, container_id: &str, workspace: &PathBuf) {
        let remove_opts = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        let _ = self.docker.remove_container(container_id, Some(remove_opts)).await;
        let _ = tokio::fs::remove_dir_all(workspace).await;
    }
}

async fn stage_workspace(request: &ExecutionRequest) -> Result<PathBuf, SandboxError> {
    let dir = std::env::temp_dir().join(format!("capibara_{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await?;
    let ext = extension_for(&request.language);
    let script_path = dir.join(format!("script.{ext}"));
    tokio::fs::write(&script_path, &request.code).await?;

    #[cfg(unix)]
    if request.language == "bash" {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&script_path).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&script_path, perms).await?;
    }

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_selection_matches_language() {
        assert_eq!(image_for("python").unwrap(), "python:3.11-slim");
        assert_eq!(image_for("javascript").unwrap(), "node:18-slim");
        assert_eq!(image_for("bash").unwrap(), "alpine:latest");
        assert_eq!(image_for("powershell").unwrap(), "mcr.microsoft.com/powershell:latest");
        assert!(image_for("ruby").is_err());
    }

    #[test]
    fn command_matches_language() {
        assert_eq!(command_for("python"), vec!["python", "/workspace/script.py"]);
        assert_eq!(command_for("bash"), vec!["/bin/sh", "/workspace/script.sh"]);
    }

    #[tokio::test]
    async fn stage_workspace_writes_script_with_right_extension() {
        let request = ExecutionRequest {
            code: "print('hi')".to_string(),
            language: "python".to_string(),
            cpu_seconds: 10,
            memory_mb: 128,
            wall_seconds: 30,
        };
        let dir = stage_workspace(&request).await.unwrap();
        let contents = tokio::fs::read_to_string(dir.join("script.py")).await.unwrap();
        assert_eq!(contents, "print('hi')");
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn bash_script_is_made_executable() {
        let request = ExecutionRequest {
            code: "echo hi".to_string(),
            language: "bash".to_string(),
            cpu_seconds: 10,
            memory_mb: 128,
            wall_seconds: 30,
        };
        let dir = stage_workspace(&request).await.unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let meta = tokio::fs::metadata(dir.join("script.sh")).await.unwrap();
            assert_eq!(meta.permissions().mode() & 0o777, 0o755);
        }
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
