//! Orphan reaper
//!
//! The runner cleans up after itself on every exit path, but a crashed host
//! process can leave containers and scratch directories behind. The reaper
//! periodically removes anything carrying the engine's name prefix that is
//! older than a configurable threshold.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::container::ContainerDriver;

/// Name prefix every engine container carries.
pub const CONTAINER_PREFIX: &str = "edgeql-";

/// Reaper schedule and age threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaperConfig {
    /// Time between sweeps
    pub interval: Duration,
    /// Minimum age before an orphan is collected
    pub max_age: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_age: Duration::from_secs(3600),
        }
    }
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Containers force-removed
    pub containers_removed: usize,
    /// Scratch directories deleted
    pub dirs_removed: usize,
}

/// Periodic orphan collector.
#[derive(Debug, Clone)]
pub struct Reaper {
    driver: ContainerDriver,
    scratch_root: PathBuf,
    config: ReaperConfig,
}

impl Reaper {
    /// Create a reaper over a driver and scratch root.
    pub fn new(driver: ContainerDriver, scratch_root: PathBuf, config: ReaperConfig) -> Self {
        Self {
            driver,
            scratch_root,
            config,
        }
    }

    /// Spawn the sweep loop; it stops when the token is cancelled.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.interval);
            // The first tick fires immediately; skip it so a fresh engine
            // does not race its own first invocations.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = self.sweep_once().await;
                        if stats != SweepStats::default() {
                            info!(
                                containers = stats.containers_removed,
                                dirs = stats.dirs_removed,
                                "reaper collected orphans"
                            );
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("reaper stopped");
                        return;
                    }
                }
            }
        })
    }

    /// One sweep over containers and scratch directories.
    pub async fn sweep_once(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        stats.containers_removed = self.sweep_containers().await;
        stats.dirs_removed = self.sweep_scratch_dirs();
        stats
    }

    async fn sweep_containers(&self) -> usize {
        let listed = match self.driver.list_by_prefix(CONTAINER_PREFIX).await {
            Ok(listed) => listed,
            Err(err) => {
                warn!(%err, "reaper could not list containers");
                return 0;
            }
        };
        let mut removed = 0;
        for (name, created_at) in listed {
            if !is_older_than(&created_at, self.config.max_age) {
                continue;
            }
            debug!(container = %name, created = %created_at, "reaping orphaned container");
            self.driver.remove(&name).await;
            removed += 1;
        }
        removed
    }

    fn sweep_scratch_dirs(&self) -> usize {
        let entries = match std::fs::read_dir(&self.scratch_root) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let age = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok());
            match age {
                Some(age) if age >= self.config.max_age => {
                    if let Err(err) = std::fs::remove_dir_all(&path) {
                        warn!(dir = %path.display(), %err, "reaper could not remove scratch dir");
                    } else {
                        removed += 1;
                    }
                }
                _ => {}
            }
        }
        removed
    }
}

/// Parse a driver `CreatedAt` value and compare against the age threshold.
///
/// Docker prints `2024-01-02 10:30:00 +0000 UTC`; podman prints RFC 3339.
/// Unparsable timestamps are treated as *not* old enough, so a format drift
/// never mass-deletes live containers.
fn is_older_than(created_at: &str, max_age: Duration) -> bool {
    let parsed = parse_created_at(created_at);
    match parsed {
        Some(created) => {
            let age = Utc::now().signed_duration_since(created);
            age.to_std().map(|age| age >= max_age).unwrap_or(false)
        }
        None => false,
    }
}

fn parse_created_at(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Docker's table format: "2024-01-02 10:30:00 +0000 UTC"
    let trimmed = text.trim_end_matches(" UTC");
    if let Ok(parsed) = DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S %z") {
        return Some(parsed.with_timezone(&Utc));
    }
    None
}
