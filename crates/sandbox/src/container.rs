//! Container driver and live-container registry
//!
//! The driver shells out to an OCI CLI (`docker` by default, `podman` works
//! identically for the subcommands used here). Argument construction is kept
//! in pure functions so the hardened flag set is testable without a daemon.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::limits::ResourceLimits;
use crate::{Result, SandboxError};

/// Container-side mount point for the per-invocation working directory.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Container-side mount point for the node source directory (read-only).
pub const NODE_MOUNT: &str = "/node";

/// Container-side mount point for the dataset root (read-only).
pub const DATASETS_MOUNT: &str = "/datasets";

/// Non-root uid:gid the container runs as.
const CONTAINER_USER: &str = "1000:1000";

/// Everything needed to start one container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    /// Stable container name (derived from run id + node id)
    pub name: String,
    /// Image to run
    pub image: String,
    /// Command executed inside the container (harness argv)
    pub command: Vec<String>,
    /// Host path mounted read-write at [`WORKSPACE_MOUNT`]
    pub workdir: PathBuf,
    /// Host path mounted read-only at [`NODE_MOUNT`]
    pub node_dir: Option<PathBuf>,
    /// Host path mounted read-only at [`DATASETS_MOUNT`]
    pub datasets_dir: Option<PathBuf>,
    /// Resource limits to enforce
    pub limits: ResourceLimits,
}

/// Post-exit container state, from `inspect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerState {
    /// Process exit code
    pub exit_code: i32,
    /// True if the kernel OOM killer terminated the container
    pub oom_killed: bool,
}

/// One resource-usage sample, from `stats --no-stream`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSample {
    /// Memory usage in bytes at sample time
    pub memory_bytes: u64,
    /// CPU usage percentage at sample time
    pub cpu_percent: f64,
}

/// Build the full `run` argument vector for a spec.
///
/// The flag set enforces the sandbox contract: detached, named, non-root,
/// no privilege escalation, read-only root filesystem, no network, CPU and
/// memory caps, bounded pids, and an ephemeral tmpfs for `/tmp`.
pub fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "--detach".into(),
        "--name".into(),
        spec.name.clone(),
        "--user".into(),
        CONTAINER_USER.into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--read-only".into(),
        "--network".into(),
        "none".into(),
        "--cpus".into(),
        format!("{}", spec.limits.cpus),
        "--memory".into(),
        format!("{}m", spec.limits.memory_mib),
        "--memory-swap".into(),
        format!("{}m", spec.limits.memory_mib),
        "--pids-limit".into(),
        format!("{}", spec.limits.pids),
        "--tmpfs".into(),
        format!("/tmp:rw,size={}m", spec.limits.tmpfs_mib),
        "--workdir".into(),
        WORKSPACE_MOUNT.into(),
        "--volume".into(),
        format!("{}:{}:rw", spec.workdir.display(), WORKSPACE_MOUNT),
    ];
    if let Some(node_dir) = &spec.node_dir {
        args.push("--volume".into());
        args.push(format!("{}:{}:ro", node_dir.display(), NODE_MOUNT));
    }
    if let Some(datasets_dir) = &spec.datasets_dir {
        args.push("--volume".into());
        args.push(format!("{}:{}:ro", datasets_dir.display(), DATASETS_MOUNT));
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Sanitize a run/node id pair into a valid container name.
///
/// Container names must match `[a-zA-Z0-9][a-zA-Z0-9_.-]*`; anything else is
/// mapped to `-`. The name is stable for a given (run, node) pair, which
/// makes cleanup idempotent.
pub fn container_name(run_id: &str, node_id: &str) -> String {
    let raw = format!("edgeql-{run_id}-{node_id}");
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Thin async wrapper over the container CLI.
#[derive(Debug, Clone)]
pub struct ContainerDriver {
    binary: PathBuf,
}

impl ContainerDriver {
    /// Use an explicit driver binary.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Locate a driver binary on PATH (`docker`, then `podman`).
    pub fn discover() -> Result<Self> {
        for candidate in ["docker", "podman"] {
            if let Ok(path) = which::which(candidate) {
                debug!(driver = %path.display(), "container driver discovered");
                return Ok(Self::new(path));
            }
        }
        Err(SandboxError::DriverUnavailable(
            "neither docker nor podman found on PATH".to_string(),
        ))
    }

    /// Path of the driver binary.
    pub fn binary(&self) -> &PathBuf {
        &self.binary
    }

    async fn output(&self, args: &[String]) -> Result<std::process::Output> {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| SandboxError::CommandFailed(format!("{}: {err}", args[0])))
    }

    /// Start a detached container. Returns the driver's stderr on failure so
    /// the caller can distinguish start races from real faults.
    pub async fn start(&self, spec: &ContainerSpec) -> std::result::Result<(), String> {
        let args = run_args(spec);
        match self.output(&args).await {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => Err(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            Err(err) => Err(err.to_string()),
        }
    }

    /// Block until the container exits; returns its exit code.
    pub async fn wait(&self, name: &str) -> Result<i32> {
        let output = self
            .output(&["wait".to_string(), name.to_string()])
            .await?;
        if !output.status.success() {
            return Err(SandboxError::CommandFailed(format!(
                "wait {name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let code = String::from_utf8_lossy(&output.stdout);
        code.trim()
            .parse::<i32>()
            .map_err(|_| SandboxError::CommandFailed(format!("wait {name}: bad exit code {code}")))
    }

    /// Inspect exit code and OOM state after exit.
    pub async fn inspect(&self, name: &str) -> Result<ContainerState> {
        let output = self
            .output(&[
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.ExitCode}} {{.State.OOMKilled}}".to_string(),
                name.to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Err(SandboxError::CommandFailed(format!(
                "inspect {name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        parse_inspect_output(text.trim())
    }

    /// Capture the container's stdout and stderr streams.
    pub async fn logs(&self, name: &str) -> Result<(String, String)> {
        let output = self
            .output(&["logs".to_string(), name.to_string()])
            .await?;
        Ok((
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }

    /// Take one resource-usage sample. Returns `None` when the container has
    /// already been reaped; accounting is best-effort.
    pub async fn stats(&self, name: &str) -> Option<StatsSample> {
        let output = self
            .output(&[
                "stats".to_string(),
                "--no-stream".to_string(),
                "--format".to_string(),
                "{{.MemUsage}}\t{{.CPUPerc}}".to_string(),
                name.to_string(),
            ])
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_stats_output(String::from_utf8_lossy(&output.stdout).trim())
    }

    /// Stop with a grace period (SIGTERM, then SIGKILL after `grace`).
    pub async fn stop(&self, name: &str, grace: Duration) {
        let result = self
            .output(&[
                "stop".to_string(),
                "--time".to_string(),
                format!("{}", grace.as_secs().max(1)),
                name.to_string(),
            ])
            .await;
        if let Err(err) = result {
            warn!(container = name, %err, "container stop failed");
        }
    }

    /// Kill immediately.
    pub async fn kill(&self, name: &str) {
        if let Err(err) = self.output(&["kill".to_string(), name.to_string()]).await {
            warn!(container = name, %err, "container kill failed");
        }
    }

    /// Force-remove. Idempotent: missing containers are not an error.
    pub async fn remove(&self, name: &str) {
        if let Err(err) = self
            .output(&[
                "rm".to_string(),
                "--force".to_string(),
                name.to_string(),
            ])
            .await
        {
            warn!(container = name, %err, "container remove failed");
        }
    }

    /// List container names matching a name prefix, with creation timestamps
    /// in RFC 3339 form where the driver provides them.
    pub async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let output = self
            .output(&[
                "ps".to_string(),
                "--all".to_string(),
                "--filter".to_string(),
                format!("name={prefix}"),
                "--format".to_string(),
                "{{.Names}}\t{{.CreatedAt}}".to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Err(SandboxError::CommandFailed(format!(
                "ps: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(2, '\t');
                let name = parts.next()?.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), parts.next().unwrap_or("").trim().to_string()))
            })
            .collect())
    }
}

fn parse_inspect_output(text: &str) -> Result<ContainerState> {
    let mut parts = text.split_whitespace();
    let exit_code = parts
        .next()
        .and_then(|s| s.parse::<i32>().ok())
        .ok_or_else(|| SandboxError::CommandFailed(format!("inspect: bad output '{text}'")))?;
    let oom_killed = matches!(parts.next(), Some("true"));
    Ok(ContainerState {
        exit_code,
        oom_killed,
    })
}

fn parse_stats_output(text: &str) -> Option<StatsSample> {
    // Format: "123.4MiB / 512MiB\t2.57%"
    let mut parts = text.split('\t');
    let mem = parts.next()?.split('/').next()?.trim();
    let cpu = parts.next()?.trim().trim_end_matches('%');
    Some(StatsSample {
        memory_bytes: parse_mem_bytes(mem)?,
        cpu_percent: cpu.parse().ok()?,
    })
}

fn parse_mem_bytes(text: &str) -> Option<u64> {
    let units: [(&str, f64); 6] = [
        ("KiB", 1024.0),
        ("MiB", 1024.0 * 1024.0),
        ("GiB", 1024.0 * 1024.0 * 1024.0),
        ("kB", 1000.0),
        ("MB", 1000.0 * 1000.0),
        ("GB", 1e9),
    ];
    for (suffix, factor) in units {
        if let Some(value) = text.strip_suffix(suffix) {
            return Some((value.trim().parse::<f64>().ok()? * factor) as u64);
        }
    }
    if let Some(value) = text.strip_suffix('B') {
        return Some(value.trim().parse::<f64>().ok()? as u64);
    }
    text.parse::<u64>().ok()
}

/// Tracks live containers per run so cancellation and cleanup can find them.
///
/// This is the only shared mutable structure across executor workers; keep
/// the critical sections to a single insert or remove.
#[derive(Debug, Clone, Default)]
pub struct ContainerRegistry {
    inner: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl ContainerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live container for a run.
    pub fn register(&self, run_id: &str, container: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entry(run_id.to_string())
            .or_default()
            .insert(container.to_string());
    }

    /// Remove a container; drops the run entry when it was the last one.
    pub fn deregister(&self, run_id: &str, container: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = inner.get_mut(run_id) {
            set.remove(container);
            if set.is_empty() {
                inner.remove(run_id);
            }
        }
    }

    /// Snapshot the live containers for a run.
    pub fn containers_for(&self, run_id: &str) -> Vec<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .get(run_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of live containers across all runs.
    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.values().map(HashSet::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_spec() -> ContainerSpec {
        ContainerSpec {
            name: "edgeql-run1-node1".to_string(),
            image: "edgeql/runtime-js:latest".to_string(),
            command: vec!["node".to_string(), "/usr/local/lib/edgeql/harness.js".to_string()],
            workdir: PathBuf::from("/var/lib/edgeql/run1/node1"),
            node_dir: Some(PathBuf::from("/opt/nodes/momentum")),
            datasets_dir: Some(PathBuf::from("/data/datasets")),
            limits: ResourceLimits::default(),
        }
    }

    #[test]
    fn test_run_args_hardening_flags() {
        let args = run_args(&sample_spec());
        let joined = args.join(" ");
        assert!(joined.contains("--detach"));
        assert!(joined.contains("--user 1000:1000"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--cpus 1"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--memory-swap 512m"));
        assert!(joined.contains("--pids-limit 128"));
        assert!(joined.contains("--tmpfs /tmp:rw,size=100m"));
    }

    #[test]
    fn test_run_args_mounts() {
        let args = run_args(&sample_spec());
        let joined = args.join(" ");
        assert!(joined.contains("/var/lib/edgeql/run1/node1:/workspace:rw"));
        assert!(joined.contains("/opt/nodes/momentum:/node:ro"));
        assert!(joined.contains("/data/datasets:/datasets:ro"));
    }

    #[test]
    fn test_run_args_optional_mounts_absent() {
        let mut spec = sample_spec();
        spec.node_dir = None;
        spec.datasets_dir = None;
        let joined = run_args(&spec).join(" ");
        assert!(!joined.contains(":/node:ro"));
        assert!(!joined.contains(":/datasets:ro"));
    }

    #[test]
    fn test_run_args_image_before_command() {
        let args = run_args(&sample_spec());
        let image_pos = args
            .iter()
            .position(|a| a == "edgeql/runtime-js:latest")
            .unwrap();
        let cmd_pos = args.iter().position(|a| a == "node").unwrap();
        assert!(image_pos < cmd_pos);
        // Command is the tail of the argv
        assert_eq!(args.last().unwrap(), "/usr/local/lib/edgeql/harness.js");
    }

    #[test]
    fn test_container_name_stable_and_sanitized() {
        assert_eq!(container_name("run1", "node1"), "edgeql-run1-node1");
        assert_eq!(container_name("run1", "node1"), container_name("run1", "node1"));
        // Invalid characters are replaced
        assert_eq!(container_name("r/1", "my node"), "edgeql-r-1-my-node");
    }

    #[test]
    fn test_parse_inspect_output() {
        let state = parse_inspect_output("137 true").unwrap();
        assert_eq!(state.exit_code, 137);
        assert!(state.oom_killed);

        let state = parse_inspect_output("0 false").unwrap();
        assert_eq!(state.exit_code, 0);
        assert!(!state.oom_killed);
    }

    #[test]
    fn test_parse_inspect_output_garbage() {
        assert!(parse_inspect_output("no numbers here").is_err());
        assert!(parse_inspect_output("").is_err());
    }

    #[test]
    fn test_parse_stats_output() {
        let sample = parse_stats_output("123.4MiB / 512MiB\t2.57%").unwrap();
        assert_eq!(sample.memory_bytes, (123.4f64 * 1024.0 * 1024.0) as u64);
        assert!((sample.cpu_percent - 2.57).abs() < 1e-9);
    }

    #[test]
    fn test_parse_stats_output_small_units() {
        let sample = parse_stats_output("900KiB / 512MiB\t0.00%").unwrap();
        assert_eq!(sample.memory_bytes, 900 * 1024);
    }

    #[test]
    fn test_parse_stats_output_garbage() {
        assert!(parse_stats_output("???").is_none());
        assert!(parse_stats_output("").is_none());
    }

    #[test]
    fn test_parse_mem_bytes_units() {
        assert_eq!(parse_mem_bytes("1KiB"), Some(1024));
        assert_eq!(parse_mem_bytes("1MB"), Some(1_000_000));
        assert_eq!(parse_mem_bytes("2GiB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_mem_bytes("512B"), Some(512));
    }

    #[test]
    fn test_registry_register_deregister() {
        let registry = ContainerRegistry::new();
        registry.register("run1", "c1");
        registry.register("run1", "c2");
        registry.register("run2", "c3");
        assert_eq!(registry.live_count(), 3);

        let mut names = registry.containers_for("run1");
        names.sort();
        assert_eq!(names, vec!["c1", "c2"]);

        registry.deregister("run1", "c1");
        registry.deregister("run1", "c2");
        assert!(registry.containers_for("run1").is_empty());
        assert_eq!(registry.live_count(), 1);
    }

    #[test]
    fn test_registry_deregister_unknown_is_noop() {
        let registry = ContainerRegistry::new();
        registry.deregister("missing", "c1");
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn test_driver_new_keeps_binary() {
        let driver = ContainerDriver::new("/usr/bin/docker");
        assert_eq!(driver.binary(), &PathBuf::from("/usr/bin/docker"));
    }
}
