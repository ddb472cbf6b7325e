//! Resource limits enforced on every sandboxed invocation
//!
//! Defaults follow the engine contract: one CPU, 512 MiB of memory, a
//! 100 MiB tmpfs for `/tmp`, and a 60 second wall clock. Node manifests may
//! override individual limits; the engine clamps nothing beyond what the
//! container driver itself rejects.

use std::time::Duration;

/// Default CPU cap (fractional cores).
pub const DEFAULT_CPUS: f64 = 1.0;

/// Default memory cap in MiB.
pub const DEFAULT_MEMORY_MIB: u64 = 512;

/// Default tmpfs size for `/tmp` in MiB.
pub const DEFAULT_TMPFS_MIB: u64 = 100;

/// Default pid limit inside the container.
pub const DEFAULT_PIDS: u64 = 128;

/// Default wall-clock timeout for a node invocation.
pub const DEFAULT_WALL_CLOCK: Duration = Duration::from_secs(60);

/// Default deadline for the container to start.
pub const DEFAULT_CONTAINER_START: Duration = Duration::from_secs(10);

/// Default grace period between `stop` and `kill` on cancellation.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Per-invocation resource limits.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// CPU cap as fractional cores (`--cpus`)
    pub cpus: f64,
    /// Memory cap in MiB (`--memory`, swap clamped to the same value)
    pub memory_mib: u64,
    /// tmpfs size for `/tmp` in MiB
    pub tmpfs_mib: u64,
    /// Maximum number of pids inside the container
    pub pids: u64,
    /// Wall-clock budget for the invocation
    pub wall_clock: Duration,
    /// Deadline for the container to be created and started
    pub container_start: Duration,
    /// Grace period before a cancelled container is force-killed
    pub grace_period: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: DEFAULT_CPUS,
            memory_mib: DEFAULT_MEMORY_MIB,
            tmpfs_mib: DEFAULT_TMPFS_MIB,
            pids: DEFAULT_PIDS,
            wall_clock: DEFAULT_WALL_CLOCK,
            container_start: DEFAULT_CONTAINER_START,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

impl ResourceLimits {
    /// Set the CPU cap.
    pub fn with_cpus(mut self, cpus: f64) -> Self {
        self.cpus = cpus;
        self
    }

    /// Set the memory cap in MiB.
    pub fn with_memory_mib(mut self, mib: u64) -> Self {
        self.memory_mib = mib;
        self
    }

    /// Set the wall-clock timeout.
    pub fn with_wall_clock(mut self, timeout: Duration) -> Self {
        self.wall_clock = timeout;
        self
    }

    /// Set the cancellation grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Apply manifest overrides on top of these limits.
    ///
    /// `timeout_ms`, `memory_mib`, and `cpu` correspond to the optional
    /// `metadata` block of a node manifest.
    pub fn with_overrides(
        mut self,
        timeout_ms: Option<u64>,
        memory_mib: Option<u64>,
        cpu: Option<f64>,
    ) -> Self {
        if let Some(ms) = timeout_ms {
            self.wall_clock = Duration::from_millis(ms);
        }
        if let Some(mib) = memory_mib {
            self.memory_mib = mib;
        }
        if let Some(cpus) = cpu {
            self.cpus = cpus;
        }
        self
    }
}
