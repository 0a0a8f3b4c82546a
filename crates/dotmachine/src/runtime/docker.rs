//! Docker CLI runtime implementation.
//!
//! Drives the `docker` binary directly, falling back to `sudo docker` when
//! the daemon socket is not reachable as the current user.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;

use super::error::{RuntimeError, RuntimeResult};
use super::{ContainerRuntime, CreateSpec, ExecOutput, ImageStore, InstanceState, RuntimeStats};

/// Docker CLI wrapper.
#[derive(Debug, Clone)]
pub struct DockerCli {
    use_sudo: bool,
}

impl DockerCli {
    /// Wrapper that invokes `docker` as the current user.
    pub fn new() -> Self {
        Self { use_sudo: false }
    }

    /// Probe the daemon and fall back to sudo when plain `docker ps` fails.
    pub async fn detect() -> Self {
        let direct = Command::new("docker")
            .arg("ps")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        if !direct {
            debug!("docker not reachable as current user, using sudo");
        }
        Self { use_sudo: !direct }
    }

    /// Run a docker subcommand, returning stdout on success.
    async fn run(&self, args: &[&str]) -> RuntimeResult<String> {
        let (exit_code, stdout, stderr) = self.run_raw(args).await?;
        if exit_code != 0 {
            if is_not_found(&stderr) {
                return Err(RuntimeError::NotFound(
                    args.last().unwrap_or(&"").to_string(),
                ));
            }
            return Err(RuntimeError::CommandFailed {
                command: format!("docker {}", args.join(" ")),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(stdout)
    }

    /// Run a docker subcommand, capturing exit code and both streams.
    async fn run_raw(&self, args: &[&str]) -> RuntimeResult<(i32, String, String)> {
        let mut cmd = if self.use_sudo {
            let mut c = Command::new("sudo");
            c.arg("docker");
            c
        } else {
            Command::new("docker")
        };
        let output = cmd.args(args).output().await?;
        Ok((
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create(&self, spec: &CreateSpec) -> RuntimeResult<()> {
        spec.validate()?;

        let memory = format!("{}M", spec.memory_mb);
        let cpu_period = spec.cpu_period.to_string();
        let cpu_quota = spec.cpu_quota.to_string();
        let storage = format!("size={}", spec.storage);

        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            spec.name.clone(),
            "--privileged".into(),
            "--cap-add=NET_ADMIN".into(),
            "--cap-add=NET_RAW".into(),
            "--cpu-period".into(),
            cpu_period,
            "--cpu-quota".into(),
            cpu_quota,
            "--memory".into(),
            memory,
            "--storage-opt".into(),
            storage,
        ];
        for (host, container) in &spec.ports {
            args.push("-p".into());
            args.push(format!("{}:{}", host, container));
        }
        for (host_path, container_path) in &spec.volumes {
            args.push("-v".into());
            args.push(format!("{}:{}:rw", host_path, container_path));
        }
        for (key, value) in &spec.env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(spec.image.clone());

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs).await?;
        Ok(())
    }

    async fn start(&self, name: &str) -> RuntimeResult<()> {
        self.run(&["start", name]).await?;
        Ok(())
    }

    async fn stop(&self, name: &str) -> RuntimeResult<()> {
        self.run(&["stop", name]).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> RuntimeResult<()> {
        self.run(&["rm", "-f", name]).await?;
        Ok(())
    }

    async fn exec(&self, name: &str, argv: &[&str]) -> RuntimeResult<ExecOutput> {
        let mut args = vec!["exec", name];
        args.extend_from_slice(argv);
        let (exit_code, stdout, stderr) = self.run_raw(&args).await?;
        if exit_code != 0 && is_not_found(&stderr) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        let mut output = stdout;
        if !stderr.is_empty() {
            output.push_str(&stderr);
        }
        Ok(ExecOutput { exit_code, output })
    }

    async fn copy_into(&self, name: &str, local: &Path, remote: &str) -> RuntimeResult<()> {
        let src = local.to_string_lossy();
        let dst = format!("{}:{}", name, remote);
        self.run(&["cp", &src, &dst]).await?;
        Ok(())
    }

    async fn copy_from(&self, name: &str, remote: &str, local: &Path) -> RuntimeResult<()> {
        let src = format!("{}:{}", name, remote);
        let dst = local.to_string_lossy();
        self.run(&["cp", &src, &dst]).await?;
        Ok(())
    }

    async fn inspect(&self, name: &str) -> RuntimeResult<InstanceState> {
        match self
            .run(&["inspect", "--format", "{{.State.Running}}", name])
            .await
        {
            Ok(out) => Ok(InstanceState {
                exists: true,
                running: out.trim() == "true",
            }),
            Err(RuntimeError::NotFound(_)) => Ok(InstanceState::default()),
            Err(err) => Err(err),
        }
    }

    async fn stats(&self, name: &str) -> RuntimeResult<RuntimeStats> {
        let out = self
            .run(&["stats", "--no-stream", "--format", "{{json .}}", name])
            .await?;
        parse_stats_line(out.trim())
    }

    async fn reset_network(&self) -> RuntimeResult<()> {
        warn!("resetting docker network layer");
        self.run(&["network", "prune", "-f"]).await?;
        Ok(())
    }

    fn shell_command(&self, name: &str, login_user: &str) -> Vec<String> {
        let mut argv = Vec::new();
        if self.use_sudo {
            argv.push("sudo".to_string());
        }
        argv.extend(
            ["docker", "exec", "-it", name, "su", "-", login_user]
                .iter()
                .map(|s| s.to_string()),
        );
        argv
    }
}

#[async_trait]
impl ImageStore for DockerCli {
    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        match self.run(&["image", "inspect", image]).await {
            Ok(_) => Ok(true),
            Err(RuntimeError::NotFound(_)) => Ok(false),
            Err(RuntimeError::CommandFailed { stderr, .. })
                if stderr.to_lowercase().contains("no such image") =>
            {
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn build_image(
        &self,
        image: &str,
        dockerfile: &Path,
        context: &Path,
    ) -> RuntimeResult<()> {
        let dockerfile = dockerfile.to_string_lossy();
        let context = context.to_string_lossy();
        self.run(&["build", "-t", image, "-f", &dockerfile, &context])
            .await?;
        Ok(())
    }
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// One line of `docker stats --format '{{json .}}'` output.
#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(alias = "CPUPerc", alias = "CPU")]
    cpu_perc: String,
    #[serde(alias = "MemUsage")]
    mem_usage: String,
}

fn parse_stats_line(line: &str) -> RuntimeResult<RuntimeStats> {
    let stats: StatsLine = serde_json::from_str(line)
        .map_err(|e| RuntimeError::Malformed(format!("stats line: {}", e)))?;
    let cpu_percent = parse_percent(&stats.cpu_perc)?;
    let (mem_used, mem_limit) = parse_mem_usage(&stats.mem_usage)?;
    Ok(RuntimeStats {
        cpu_percent,
        mem_used,
        mem_limit,
    })
}

/// Parse a percentage string like `"0.05%"`.
fn parse_percent(s: &str) -> RuntimeResult<f64> {
    s.trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .map_err(|_| RuntimeError::Malformed(format!("percentage: '{}'", s)))
}

/// Parse a usage pair like `"532KiB / 51.2MiB"` into bytes.
fn parse_mem_usage(s: &str) -> RuntimeResult<(u64, u64)> {
    let mut parts = s.splitn(2, '/');
    let used = parts
        .next()
        .ok_or_else(|| RuntimeError::Malformed(format!("memory usage: '{}'", s)))?;
    let limit = parts
        .next()
        .ok_or_else(|| RuntimeError::Malformed(format!("memory usage: '{}'", s)))?;
    Ok((parse_size(used)?, parse_size(limit)?))
}

/// Parse a human-readable size string (`"51.2MiB"`, `"3GB"`, `"0B"`).
fn parse_size(s: &str) -> RuntimeResult<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| RuntimeError::Malformed(format!("size: '{}'", s)))?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        other => {
            return Err(RuntimeError::Malformed(format!(
                "size unit '{}' in '{}'",
                other, s
            )));
        }
    };
    Ok((value * multiplier) as u64)
}
