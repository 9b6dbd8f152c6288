//! Background removal of expired archives, retention entries and abandoned sandboxes.
//!
//! A cycle runs three independent sweeps. Failure to read one directory is logged and
//! does not stop the other sweeps; the next cycle simply tries again.

use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use metrics::counter;
use time::OffsetDateTime;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::infra::sandbox::SANDBOX_PREFIX;

use super::retention::RetentionStore;

#[derive(Debug, Clone)]
pub struct ReclaimerConfig {
    pub downloads_dir: PathBuf,
    pub work_dir: PathBuf,
    pub retention: Duration,
    pub interval: Duration,
}

/// Counts of what one cycle removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub stale_files: usize,
    pub expired_entries: usize,
    pub stale_sandboxes: usize,
}

#[derive(Debug, Clone)]
pub struct Reclaimer {
    config: ReclaimerConfig,
    store: RetentionStore,
}

impl Reclaimer {
    pub fn new(config: ReclaimerConfig, store: RetentionStore) -> Self {
        Self { config, store }
    }

    pub async fn run_cycle(&self) -> ReclaimReport {
        let now = SystemTime::now();

        let stale_files = match self.sweep_downloads(now).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    target = "amxforge::application::reclaimer",
                    dir = %self.config.downloads_dir.display(),
                    error = %err,
                    "download sweep failed"
                );
                0
            }
        };

        let expired_entries = self.sweep_store().await;

        let stale_sandboxes = match self.sweep_sandboxes(now).await {
            Ok(count) => count,
            Err(err) => {
                warn!(
                    target = "amxforge::application::reclaimer",
                    dir = %self.config.work_dir.display(),
                    error = %err,
                    "sandbox sweep failed"
                );
                0
            }
        };

        let report = ReclaimReport {
            stale_files,
            expired_entries,
            stale_sandboxes,
        };
        counter!("amxforge_reclaimed_total", "kind" => "file").increment(stale_files as u64);
        counter!("amxforge_reclaimed_total", "kind" => "entry").increment(expired_entries as u64);
        counter!("amxforge_reclaimed_total", "kind" => "sandbox")
            .increment(stale_sandboxes as u64);

        if report != ReclaimReport::default() {
            info!(
                target = "amxforge::application::reclaimer",
                stale_files,
                expired_entries,
                stale_sandboxes,
                "reclaim cycle finished"
            );
        }
        report
    }

    /// Run cycles on the configured interval until the returned handle is shut down.
    /// The first cycle runs one interval after start.
    pub fn spawn(self) -> ReclaimerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let cycle = self.clone();
                        run_isolated(async move { cycle.run_cycle().await }).await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(
                target = "amxforge::application::reclaimer",
                "reclaimer stopped"
            );
        });
        ReclaimerHandle { stop: stop_tx, task }
    }

    async fn sweep_downloads(&self, now: SystemTime) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.config.downloads_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        while let Some(entry) = entries.next_entry().await? {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_file() || !self.is_stale(&metadata, now) {
                continue;
            }
            if remove_file_logged(&entry.path()).await {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn sweep_store(&self) -> usize {
        let evicted = self
            .store
            .evict_expired(OffsetDateTime::now_utc(), self.config.retention);
        for entry in &evicted {
            remove_file_logged(&self.config.downloads_dir.join(&entry.archive_filename)).await;
        }
        evicted.len()
    }

    async fn sweep_sandboxes(&self, now: SystemTime) -> io::Result<usize> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.config.work_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().starts_with(SANDBOX_PREFIX) {
                continue;
            }
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() || !self.is_stale(&metadata, now) {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(
                    target = "amxforge::application::reclaimer",
                    path = %entry.path().display(),
                    error = %err,
                    "failed to remove abandoned sandbox"
                ),
            }
        }
        Ok(removed)
    }

    fn is_stale(&self, metadata: &std::fs::Metadata, now: SystemTime) -> bool {
        metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > self.config.retention)
    }
}

/// Run a cycle on its own task so a panic ends that cycle only; the loop keeps its
/// schedule.
async fn run_isolated<F>(cycle: F) -> Option<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    match tokio::spawn(cycle).await {
        Ok(output) => Some(output),
        Err(err) => {
            warn!(
                target = "amxforge::application::reclaimer",
                error = %err,
                "reclaim cycle aborted"
            );
            None
        }
    }
}

/// Returns `true` when the file was removed by this call.
async fn remove_file_logged(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => {
            warn!(
                target = "amxforge::application::reclaimer",
                path = %path.display(),
                error = %err,
                "failed to remove file"
            );
            false
        }
    }
}

pub struct ReclaimerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReclaimerHandle {
    /// Signal the loop and wait for it. A cycle in progress finishes first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            warn!(
                target = "amxforge::application::reclaimer",
                error = %err,
                "reclaimer task ended abnormally"
            );
        }
    }
}
