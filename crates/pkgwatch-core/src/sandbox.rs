//! Sandboxed execution of analysis images

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

/// Path inside the container the analysis writes its report to
pub const RESULTS_MOUNT: &str = "/results";
const RESULTS_FILE: &str = "result.json";

/// Runs an analysis command inside an isolated container
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `command` in `image` and return the JSON document it produced
    async fn run(&self, image: &str, command: &[String]) -> Result<serde_json::Value>;

    /// Sandbox implementation name
    fn name(&self) -> &str;
}

/// Sandbox driven by the podman CLI.
///
/// The container gets an empty host directory mounted at `/results` and the
/// `PKGWATCH_RESULTS` variable pointing at the file to write. If the file is
/// missing after the run, stdout is parsed instead.
pub struct PodmanSandbox {
    binary: String,
    timeout: Duration,
    network: Option<String>,
}

impl PodmanSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "podman".to_string(),
            timeout,
            network: None,
        }
    }

    /// Use a different container CLI binary
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Attach containers to a named network
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    fn build_args(&self, results_dir: &str, image: &str, command: &[String]) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--volume".to_string(),
            format!("{}:{}:Z", results_dir, RESULTS_MOUNT),
            "--env".to_string(),
            format!("PKGWATCH_RESULTS={}/{}", RESULTS_MOUNT, RESULTS_FILE),
        ];
        if let Some(network) = &self.network {
            args.push(format!("--network={}", network));
        }
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        args
    }
}

#[async_trait]
impl Sandbox for PodmanSandbox {
    async fn run(&self, image: &str, command: &[String]) -> Result<serde_json::Value> {
        let results = TempDir::new()?;
        let args = self.build_args(&results.path().to_string_lossy(), image, command);
        info!("Running {} in sandbox image {}", command.join(" "), image);

        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::Sandbox(format!("Failed to start {}: {}", self.binary, e)))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| PipelineError::Timeout(self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Sandbox(format!(
                "{} exited with {}: {}",
                image,
                output.status,
                stderr.trim()
            )));
        }

        let report = results.path().join(RESULTS_FILE);
        let raw = if report.exists() {
            debug!("Reading sandbox report from {}", report.display());
            std::fs::read(&report)?
        } else {
            output.stdout
        };

        serde_json::from_slice(&raw)
            .map_err(|e| PipelineError::Sandbox(format!("{} produced an unreadable report: {}", image, e)))
    }

    fn name(&self) -> &str {
        "podman"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_arguments() {
        let sandbox = PodmanSandbox::new(Duration::from_secs(5)).with_network("analysis");
        let args = sandbox.build_args(
            "/tmp/r",
            "pkgwatch/sandbox-node:latest",
            &["/usr/local/bin/analyze.js".to_string(), "all".to_string()],
        );
        assert_eq!(args[0], "run");
        assert!(args.contains(&"/tmp/r:/results:Z".to_string()));
        assert!(args.contains(&"--network=analysis".to_string()));
        let image_pos = args.iter().position(|a| a == "pkgwatch/sandbox-node:latest").unwrap();
        assert_eq!(&args[image_pos + 1..], &["/usr/local/bin/analyze.js", "all"]);
    }

    #[cfg(unix)]
    fn fake_cli(dir: &std::path::Path, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-podman");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_report_is_parsed() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), r#"printf '{"Files":[{"Path":"/etc/passwd"}]}'"#);
        let sandbox = PodmanSandbox::new(Duration::from_secs(5)).with_binary(cli);

        let doc = sandbox.run("image", &["analyze".to_string()]).await.unwrap();
        assert_eq!(doc["Files"][0]["Path"], "/etc/passwd");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_run_is_sandbox_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), "echo 'image not found' >&2; exit 125");
        let sandbox = PodmanSandbox::new(Duration::from_secs(5)).with_binary(cli);

        match sandbox.run("image", &[]).await {
            Err(PipelineError::Sandbox(msg)) => assert!(msg.contains("image not found")),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_report() {
        let dir = tempfile::TempDir::new().unwrap();
        let cli = fake_cli(dir.path(), "echo not json");
        let sandbox = PodmanSandbox::new(Duration::from_secs(5)).with_binary(cli);
        assert!(matches!(
            sandbox.run("image", &[]).await,
            Err(PipelineError::Sandbox(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_sandbox_error() {
        let sandbox = PodmanSandbox::new(Duration::from_secs(5)).with_binary("definitely-not-a-container-cli");
        let result = sandbox.run("image", &[]).await;
        assert!(matches!(result, Err(PipelineError::Sandbox(_))));
    }
}
