//! Invocation lifecycle: provision, launch, wait, classify, clean up
//!
//! One [`Invocation`] is one custom-node execution in one ephemeral
//! container. Every exit path (success, failure, timeout, cancellation)
//! ends with the container removed and the working directory deleted;
//! crashes are covered by the [`crate::reaper`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::{
    container_name, ContainerDriver, ContainerRegistry, ContainerSpec, StatsSample, NODE_MOUNT,
    WORKSPACE_MOUNT,
};
use crate::image::{ImageCatalog, NodeRuntime};
use crate::limits::ResourceLimits;
use crate::protocol::{
    read_log_file, read_output_descriptor, write_input_descriptor, InputDescriptor,
    OutputDescriptor, WireLogEntry, INPUT_FILE, LOG_FILE, OUTPUT_FILE,
};
use crate::{Result, SandboxError};

/// Failure classification for a sandboxed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The node's code exited nonzero
    Runtime,
    /// Wall-clock budget exceeded
    Timeout,
    /// Killed by the memory limit
    ResourceExhaustion,
    /// Exit 0 but the output descriptor is missing or malformed
    Protocol,
    /// The container could not be provisioned or started
    Infrastructure,
    /// Terminated by cancellation
    Cancelled,
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// Exit 0 with a well-formed output descriptor
    Completed(OutputDescriptor),
    /// Anything else, classified
    Failed {
        kind: FailureKind,
        message: String,
    },
}

impl InvocationOutcome {
    /// True for the `Completed` variant.
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Completed(_))
    }
}

/// Everything the caller hands over for one invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Run this invocation belongs to
    pub run_id: String,
    /// Node id within the pipeline
    pub node_id: String,
    /// Language family, selects the image
    pub runtime: NodeRuntime,
    /// Host directory containing the node's sources (mounted read-only)
    pub node_root: PathBuf,
    /// Entry-point file, must live under `node_root`
    pub entry_point: PathBuf,
    /// Marshalled input descriptor
    pub input: InputDescriptor,
    /// Extra files written into the working directory before launch, as
    /// (workdir-relative path, contents); used for file-marshalled artifacts
    pub extra_files: Vec<(String, Vec<u8>)>,
    /// Resolved resource limits (manifest overrides already applied)
    pub limits: ResourceLimits,
}

/// Result of one invocation: outcome plus logs and accounting.
#[derive(Debug, Clone)]
pub struct InvocationReport {
    /// Classified outcome
    pub outcome: InvocationOutcome,
    /// Ordered structured log entries (harness logs plus stderr)
    pub logs: Vec<WireLogEntry>,
    /// Wall-clock duration from launch to exit
    pub duration: Duration,
    /// One resource-usage sample, when the driver still had the container
    pub stats: Option<StatsSample>,
}

/// Configuration for a [`SandboxRunner`].
#[derive(Debug, Clone)]
pub struct SandboxRunnerConfig {
    /// Explicit driver binary; discovered on PATH when `None`
    pub driver_binary: Option<PathBuf>,
    /// Root under which per-invocation working directories are created
    pub scratch_root: PathBuf,
    /// Host dataset root mounted read-only into every container
    pub datasets_dir: Option<PathBuf>,
    /// Runtime → image mapping
    pub images: ImageCatalog,
}

/// Executes sandboxed invocations and tracks their containers.
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    driver: ContainerDriver,
    registry: ContainerRegistry,
    config: SandboxRunnerConfig,
}

impl SandboxRunner {
    /// Build a runner, discovering the container driver when not pinned.
    pub fn new(config: SandboxRunnerConfig) -> Result<Self> {
        let driver = match &config.driver_binary {
            Some(binary) => ContainerDriver::new(binary.clone()),
            None => ContainerDriver::discover()?,
        };
        Ok(Self {
            driver,
            registry: ContainerRegistry::new(),
            config,
        })
    }

    /// The live-container registry (shared with the reaper and tests).
    pub fn registry(&self) -> &ContainerRegistry {
        &self.registry
    }

    /// The container driver in use.
    pub fn driver(&self) -> &ContainerDriver {
        &self.driver
    }

    /// Working directory for one invocation.
    fn workdir_for(&self, run_id: &str, node_id: &str) -> PathBuf {
        self.config.scratch_root.join(run_id).join(node_id)
    }

    /// Run one invocation to completion.
    ///
    /// Host-side faults before the container exists surface as
    /// `Failed { kind: Infrastructure }` rather than `Err` so that the caller
    /// sees a uniform report; `Err` is reserved for unusable invocations
    /// (entry point outside the node root and similar).
    pub async fn invoke(
        &self,
        invocation: Invocation,
        cancel: CancellationToken,
    ) -> Result<InvocationReport> {
        let entry_rel = invocation
            .entry_point
            .strip_prefix(&invocation.node_root)
            .map_err(|_| {
                SandboxError::InvalidInvocation(format!(
                    "entry point {} is not under node root {}",
                    invocation.entry_point.display(),
                    invocation.node_root.display()
                ))
            })?
            .to_path_buf();

        let workdir = self.workdir_for(&invocation.run_id, &invocation.node_id);
        let name = container_name(&invocation.run_id, &invocation.node_id);

        let report = match self.provision(&workdir, &invocation) {
            Ok(()) => {
                let spec = self.build_spec(&name, &invocation, &entry_rel, &workdir);
                self.run_container(&invocation, &spec, &workdir, cancel).await
            }
            Err(err) => InvocationReport {
                outcome: InvocationOutcome::Failed {
                    kind: FailureKind::Infrastructure,
                    message: format!("failed to provision working directory: {err}"),
                },
                logs: Vec::new(),
                duration: Duration::ZERO,
                stats: None,
            },
        };

        // Cleanup runs on every path; both removals are idempotent.
        self.registry.deregister(&invocation.run_id, &name);
        self.driver.remove(&name).await;
        if let Err(err) = tokio::fs::remove_dir_all(&workdir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(workdir = %workdir.display(), %err, "failed to remove working directory");
            }
        }

        Ok(report)
    }

    /// Cancel every live container belonging to a run: `stop` with the grace
    /// period, then `kill`, then remove. Safe to call repeatedly and for
    /// unknown runs.
    pub async fn cancel_run(&self, run_id: &str, grace: Duration) {
        let containers = self.registry.containers_for(run_id);
        if containers.is_empty() {
            return;
        }
        info!(run_id, count = containers.len(), "cancelling live containers");
        for name in containers {
            self.driver.stop(&name, grace).await;
            self.driver.kill(&name).await;
            self.driver.remove(&name).await;
            self.registry.deregister(run_id, &name);
        }
    }

    fn provision(&self, workdir: &PathBuf, invocation: &Invocation) -> std::io::Result<()> {
        std::fs::create_dir_all(workdir)?;
        write_input_descriptor(workdir, &invocation.input).map_err(|err| {
            std::io::Error::other(format!("input descriptor: {err}"))
        })?;
        for (rel_path, contents) in &invocation.extra_files {
            let path = workdir.join(rel_path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, contents)?;
        }
        Ok(())
    }

    fn build_spec(
        &self,
        name: &str,
        invocation: &Invocation,
        entry_rel: &std::path::Path,
        workdir: &PathBuf,
    ) -> ContainerSpec {
        let mut command = self.config.images.harness_for(invocation.runtime);
        command.push(format!("{NODE_MOUNT}/{}", entry_rel.display()));
        command.push(format!("{WORKSPACE_MOUNT}/{INPUT_FILE}"));
        command.push(format!("{WORKSPACE_MOUNT}/{OUTPUT_FILE}"));
        command.push(format!("{WORKSPACE_MOUNT}/{LOG_FILE}"));
        ContainerSpec {
            name: name.to_string(),
            image: self.config.images.image_for(invocation.runtime).to_string(),
            command,
            workdir: workdir.clone(),
            node_dir: Some(invocation.node_root.clone()),
            datasets_dir: self.config.datasets_dir.clone(),
            limits: invocation.limits.clone(),
        }
    }

    async fn run_container(
        &self,
        invocation: &Invocation,
        spec: &ContainerSpec,
        workdir: &PathBuf,
        cancel: CancellationToken,
    ) -> InvocationReport {
        let limits = &invocation.limits;

        // Start, with a deadline and one retry for start races (a stale
        // container of the same name from a crashed prior run).
        let started = match self.start_with_retry(spec, limits.container_start).await {
            Ok(()) => Instant::now(),
            Err(message) => {
                return InvocationReport {
                    outcome: InvocationOutcome::Failed {
                        kind: FailureKind::Infrastructure,
                        message,
                    },
                    logs: Vec::new(),
                    duration: Duration::ZERO,
                    stats: None,
                }
            }
        };
        self.registry.register(&invocation.run_id, &spec.name);
        debug!(
            run_id = %invocation.run_id,
            node_id = %invocation.node_id,
            container = %spec.name,
            image = %spec.image,
            "container started"
        );

        enum WaitResult {
            Exited,
            TimedOut,
            Cancelled,
        }

        let waited = tokio::select! {
            result = self.driver.wait(&spec.name) => {
                if let Err(err) = result {
                    warn!(container = %spec.name, %err, "container wait failed");
                }
                WaitResult::Exited
            }
            _ = tokio::time::sleep(limits.wall_clock) => {
                self.driver.kill(&spec.name).await;
                WaitResult::TimedOut
            }
            _ = cancel.cancelled() => {
                self.driver.stop(&spec.name, limits.grace_period).await;
                self.driver.kill(&spec.name).await;
                WaitResult::Cancelled
            }
        };
        let duration = started.elapsed();

        // One stats sample and the exit state, both before removal.
        let stats = self.driver.stats(&spec.name).await;
        let state = self.driver.inspect(&spec.name).await.ok();
        let (stdout, stderr) = self.driver.logs(&spec.name).await.unwrap_or_default();
        let _ = stdout;

        let outcome = match waited {
            WaitResult::Cancelled => InvocationOutcome::Failed {
                kind: FailureKind::Cancelled,
                message: "invocation cancelled".to_string(),
            },
            WaitResult::TimedOut => InvocationOutcome::Failed {
                kind: FailureKind::Timeout,
                message: format!(
                    "node exceeded wall-clock limit of {}ms",
                    limits.wall_clock.as_millis()
                ),
            },
            WaitResult::Exited => classify_exit(state, &stderr, workdir),
        };

        let logs = collect_logs(workdir, &outcome, &stderr);
        InvocationReport {
            outcome,
            logs,
            duration,
            stats,
        }
    }

    async fn start_with_retry(
        &self,
        spec: &ContainerSpec,
        deadline: Duration,
    ) -> std::result::Result<(), String> {
        for attempt in 0..2 {
            let result = match timeout(deadline, self.driver.start(spec)).await {
                Ok(result) => result,
                Err(_) => Err(format!(
                    "container did not start within {}ms",
                    deadline.as_millis()
                )),
            };
            match result {
                Ok(()) => return Ok(()),
                Err(message) if attempt == 0 && is_start_race(&message) => {
                    warn!(container = %spec.name, %message, "start race, retrying once");
                    self.driver.remove(&spec.name).await;
                }
                Err(message) => return Err(message),
            }
        }
        unreachable!("start loop returns within two attempts")
    }
}

/// Start failures that are worth exactly one retry.
fn is_start_race(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already in use") || lower.contains("conflict")
}

/// Classify a normally exited container.
fn classify_exit(
    state: Option<crate::container::ContainerState>,
    stderr: &str,
    workdir: &std::path::Path,
) -> InvocationOutcome {
    let state = match state {
        Some(state) => state,
        None => {
            return InvocationOutcome::Failed {
                kind: FailureKind::Infrastructure,
                message: "container state unavailable after exit".to_string(),
            }
        }
    };
    if state.oom_killed {
        return InvocationOutcome::Failed {
            kind: FailureKind::ResourceExhaustion,
            message: "node killed by memory limit".to_string(),
        };
    }
    if state.exit_code != 0 {
        let first_line = stderr.lines().next().unwrap_or("").trim();
        let message = if first_line.is_empty() {
            format!("node exited with code {}", state.exit_code)
        } else {
            first_line.to_string()
        };
        return InvocationOutcome::Failed {
            kind: FailureKind::Runtime,
            message,
        };
    }
    match read_output_descriptor(workdir) {
        Ok(Some(descriptor)) => InvocationOutcome::Completed(descriptor),
        Ok(None) => InvocationOutcome::Failed {
            kind: FailureKind::Protocol,
            message: format!("node exited 0 but wrote no {OUTPUT_FILE}"),
        },
        Err(err) => InvocationOutcome::Failed {
            kind: FailureKind::Protocol,
            message: format!("malformed {OUTPUT_FILE}: {err}"),
        },
    }
}

/// Merge harness log entries with stderr lines into one offset-ordered list.
///
/// Entries from the log file and from the output descriptor are combined and
/// deduplicated by offset; stderr lines are appended as error-level entries
/// with offsets continuing after the last harness entry.
fn collect_logs(
    workdir: &std::path::Path,
    outcome: &InvocationOutcome,
    stderr: &str,
) -> Vec<WireLogEntry> {
    let mut entries = read_log_file(workdir);
    if let InvocationOutcome::Completed(descriptor) = outcome {
        entries.extend(descriptor.logs.iter().cloned());
    }
    entries.sort_by_key(|entry| entry.offset);
    entries.dedup_by_key(|entry| entry.offset);

    let mut next_offset = entries.last().map(|entry| entry.offset + 1).unwrap_or(0);
    for line in stderr.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        entries.push(WireLogEntry {
            offset: next_offset,
            ts: Utc::now(),
            level: "error".to_string(),
            message: line.to_string(),
        });
        next_offset += 1;
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ContainerState;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn write_output(dir: &std::path::Path, body: &str) {
        std::fs::write(dir.join(OUTPUT_FILE), body).unwrap();
    }

    #[test]
    fn test_is_start_race() {
        assert!(is_start_race("container name \"edgeql-a-b\" is already in use"));
        assert!(is_start_race("Conflict. The container name is reserved"));
        assert!(!is_start_race("no such image"));
        assert!(!is_start_race("permission denied"));
    }

    #[test]
    fn test_classify_oom() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = classify_exit(
            Some(ContainerState {
                exit_code: 137,
                oom_killed: true,
            }),
            "",
            dir.path(),
        );
        assert_eq!(
            outcome,
            InvocationOutcome::Failed {
                kind: FailureKind::ResourceExhaustion,
                message: "node killed by memory limit".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_runtime_error_uses_first_stderr_line() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = classify_exit(
            Some(ContainerState {
                exit_code: 1,
                oom_killed: false,
            }),
            "TypeError: frame.rows is not a function\n  at run (node.js:4)\n",
            dir.path(),
        );
        match outcome {
            InvocationOutcome::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::Runtime);
                assert_eq!(message, "TypeError: frame.rows is not a function");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_classify_runtime_error_empty_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = classify_exit(
            Some(ContainerState {
                exit_code: 3,
                oom_killed: false,
            }),
            "",
            dir.path(),
        );
        match outcome {
            InvocationOutcome::Failed { kind, message } => {
                assert_eq!(kind, FailureKind::Runtime);
                assert_eq!(message, "node exited with code 3");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_classify_missing_output_is_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = classify_exit(
            Some(ContainerState {
                exit_code: 0,
                oom_killed: false,
            }),
            "",
            dir.path(),
        );
        match outcome {
            InvocationOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::Protocol),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_classify_malformed_output_is_protocol_violation() {
        let dir = tempfile::tempdir().unwrap();
        write_output(dir.path(), "{broken");
        let outcome = classify_exit(
            Some(ContainerState {
                exit_code: 0,
                oom_killed: false,
            }),
            "",
            dir.path(),
        );
        match outcome {
            InvocationOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::Protocol),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_classify_success() {
        let dir = tempfile::tempdir().unwrap();
        write_output(dir.path(), r#"{"type": "opaque", "data": {"x": 1}}"#);
        let outcome = classify_exit(
            Some(ContainerState {
                exit_code: 0,
                oom_killed: false,
            }),
            "warning: deprecated API\n",
            dir.path(),
        );
        assert!(outcome.is_success());
    }

    #[test]
    fn test_classify_no_state_is_infrastructure() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = classify_exit(None, "", dir.path());
        match outcome {
            InvocationOutcome::Failed { kind, .. } => {
                assert_eq!(kind, FailureKind::Infrastructure)
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_collect_logs_merges_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let file_entries = [
            serde_json::json!({"offset": 0, "ts": "2024-01-01T00:00:00Z", "level": "info", "message": "start"}),
            serde_json::json!({"offset": 1, "ts": "2024-01-01T00:00:01Z", "level": "debug", "message": "work"}),
        ];
        let body = file_entries
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(dir.path().join(LOG_FILE), body).unwrap();

        let outcome = InvocationOutcome::Completed(OutputDescriptor {
            kind: "opaque".to_string(),
            data: serde_json::json!(null),
            metadata: None,
            logs: vec![WireLogEntry {
                offset: 2,
                ts: Utc::now(),
                level: "info".to_string(),
                message: "done".to_string(),
            }],
        });

        let logs = collect_logs(dir.path(), &outcome, "stderr noise\n");
        assert_eq!(logs.len(), 4);
        assert_eq!(logs[0].message, "start");
        assert_eq!(logs[2].message, "done");
        assert_eq!(logs[3].message, "stderr noise");
        assert_eq!(logs[3].level, "error");
        assert_eq!(logs[3].offset, 3);
        // Offsets strictly increasing
        assert!(logs.windows(2).all(|w| w[0].offset < w[1].offset));
    }

    #[test]
    fn test_collect_logs_dedupes_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let entry = serde_json::json!({
            "offset": 0, "ts": "2024-01-01T00:00:00Z", "level": "info", "message": "from file"
        });
        std::fs::write(dir.path().join(LOG_FILE), entry.to_string()).unwrap();
        let outcome = InvocationOutcome::Completed(OutputDescriptor {
            kind: "opaque".to_string(),
            data: serde_json::json!(null),
            metadata: None,
            logs: vec![WireLogEntry {
                offset: 0,
                ts: Utc::now(),
                level: "info".to_string(),
                message: "duplicate".to_string(),
            }],
        });
        let logs = collect_logs(dir.path(), &outcome, "");
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn test_invocation_workdir_layout() {
        let runner = SandboxRunner {
            driver: ContainerDriver::new("/usr/bin/docker"),
            registry: ContainerRegistry::new(),
            config: SandboxRunnerConfig {
                driver_binary: Some(PathBuf::from("/usr/bin/docker")),
                scratch_root: PathBuf::from("/var/lib/edgeql/scratch"),
                datasets_dir: None,
                images: ImageCatalog::default(),
            },
        };
        assert_eq!(
            runner.workdir_for("run-1", "node-a"),
            PathBuf::from("/var/lib/edgeql/scratch/run-1/node-a")
        );
    }

    #[test]
    fn test_build_spec_command_layout() {
        let runner = SandboxRunner {
            driver: ContainerDriver::new("/usr/bin/docker"),
            registry: ContainerRegistry::new(),
            config: SandboxRunnerConfig {
                driver_binary: Some(PathBuf::from("/usr/bin/docker")),
                scratch_root: PathBuf::from("/scratch"),
                datasets_dir: Some(PathBuf::from("/data")),
                images: ImageCatalog::default(),
            },
        };
        let invocation = Invocation {
            run_id: "r1".to_string(),
            node_id: "n1".to_string(),
            runtime: NodeRuntime::Javascript,
            node_root: PathBuf::from("/opt/nodes/momentum"),
            entry_point: PathBuf::from("/opt/nodes/momentum/index.js"),
            input: InputDescriptor {
                node_type: "MomentumNode".to_string(),
                params: serde_json::Map::new(),
                inputs: BTreeMap::new(),
                context: crate::protocol::InvocationContext {
                    run_id: "r1".to_string(),
                    pipeline_id: "p1".to_string(),
                    datasets: BTreeMap::new(),
                },
            },
            extra_files: Vec::new(),
            limits: ResourceLimits::default(),
        };
        let workdir = runner.workdir_for("r1", "n1");
        let spec = runner.build_spec(
            "edgeql-r1-n1",
            &invocation,
            std::path::Path::new("index.js"),
            &workdir,
        );
        assert_eq!(spec.image, "edgeql/runtime-js:latest");
        assert_eq!(spec.command[0], "node");
        assert!(spec.command.contains(&"/node/index.js".to_string()));
        assert!(spec.command.contains(&"/workspace/input.json".to_string()));
        assert!(spec.command.contains(&"/workspace/output.json".to_string()));
        assert!(spec.command.contains(&"/workspace/node.log".to_string()));
        assert_eq!(spec.datasets_dir, Some(PathBuf::from("/data")));
        assert_eq!(spec.node_dir, Some(PathBuf::from("/opt/nodes/momentum")));
    }

    #[tokio::test]
    async fn test_invoke_rejects_entry_outside_node_root() {
        let dir = tempfile::tempdir().unwrap();
        let runner = SandboxRunner {
            driver: ContainerDriver::new("/usr/bin/docker"),
            registry: ContainerRegistry::new(),
            config: SandboxRunnerConfig {
                driver_binary: Some(PathBuf::from("/usr/bin/docker")),
                scratch_root: dir.path().to_path_buf(),
                datasets_dir: None,
                images: ImageCatalog::default(),
            },
        };
        let invocation = Invocation {
            run_id: "r1".to_string(),
            node_id: "n1".to_string(),
            runtime: NodeRuntime::Python,
            node_root: PathBuf::from("/opt/nodes/a"),
            entry_point: PathBuf::from("/etc/passwd"),
            input: InputDescriptor {
                node_type: "X".to_string(),
                params: serde_json::Map::new(),
                inputs: BTreeMap::new(),
                context: crate::protocol::InvocationContext {
                    run_id: "r1".to_string(),
                    pipeline_id: "p1".to_string(),
                    datasets: BTreeMap::new(),
                },
            },
            extra_files: Vec::new(),
            limits: ResourceLimits::default(),
        };
        let result = runner.invoke(invocation, CancellationToken::new()).await;
        assert!(matches!(result, Err(SandboxError::InvalidInvocation(_))));
    }
}
