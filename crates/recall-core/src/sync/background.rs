//! Background sync coordination.
//!
//! The file lock decides whether a sync is running; the status row only
//! reports on it. A status row left "running" by a process that no longer
//! holds the lock is corrected the next time anyone reads it.

use super::auto::{SyncReport, SyncRequest};
use super::lock::{LOCK_FILENAME, SyncLock};
use crate::error::{Error, Result};
use crate::models::BackgroundSyncStatus;
use crate::storage::{Storage, wait_cancelled};
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

const TERMINATED_MESSAGE: &str = "Sync process terminated unexpectedly";
const NOT_INITIALIZED_MESSAGE: &str = "AutoSync not initialized";
const CANCELLED_MESSAGE: &str = "Sync cancelled";

/// The work a background sync performs.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    async fn sync(&self, request: &SyncRequest) -> Result<SyncReport>;

    /// Sync, then compact when anything was learned or `force_compact` is set.
    async fn sync_and_compact(&self, request: &SyncRequest, force_compact: bool)
    -> Result<SyncReport>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackgroundSyncResult {
    pub success: bool,
    pub sessions_processed: usize,
    pub learnings_extracted: usize,
    pub error_message: Option<String>,
    pub was_already_running: bool,
}

impl BackgroundSyncResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    fn already_running(reason: String) -> Self {
        Self {
            was_already_running: true,
            ..Self::failed(reason)
        }
    }
}

pub struct BackgroundSyncManager {
    storage: Arc<dyn Storage>,
    lock_path: PathBuf,
    runner: Option<Arc<dyn SyncRunner>>,
    cancel: Option<watch::Receiver<bool>>,
}

impl BackgroundSyncManager {
    /// Manager using `<agent_dir>/.background_sync.lock`.
    pub fn new(storage: Arc<dyn Storage>, agent_dir: &Path) -> Self {
        Self {
            storage,
            lock_path: agent_dir.join(LOCK_FILENAME),
            runner: None,
            cancel: None,
        }
    }

    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    pub fn with_runner(mut self, runner: Arc<dyn SyncRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Stop an in-flight sync once the channel flips to `true`.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Current status, healing a "running" row whose holder is gone.
    pub async fn get_status(&self) -> Result<BackgroundSyncStatus> {
        let status = self.storage.get_background_sync_status().await?;
        if !status.is_running || self.is_sync_running() {
            return Ok(status);
        }

        warn!(pid = ?status.pid, "Sync status says running but no process holds the lock");
        self.storage
            .complete_background_sync(
                status.sessions_processed,
                status.learnings_extracted,
                Some(TERMINATED_MESSAGE.to_string()),
            )
            .await
    }

    /// Whether another live process holds the sync lock.
    pub fn is_sync_running(&self) -> bool {
        SyncLock::new(&self.lock_path).is_held_by_another_process()
    }

    /// `(true, None)` when a sync may start, otherwise the reason it cannot.
    pub async fn can_start_sync(&self) -> Result<(bool, Option<String>)> {
        if !self.is_sync_running() {
            return Ok((true, None));
        }
        let pid = match SyncLock::new(&self.lock_path).holder_pid() {
            Some(pid) => Some(pid),
            None => self.get_status().await?.pid,
        };
        Ok((false, Some(already_running_reason(pid))))
    }

    /// Run one sync under the lock and record its outcome.
    ///
    /// Failures of the sync itself are reported in the result and in the
    /// status row; only storage errors while recording status are returned
    /// as `Err`.
    pub async fn run_sync(
        &self,
        sources: Option<Vec<String>>,
        max_sessions: Option<usize>,
        compact: bool,
    ) -> Result<BackgroundSyncResult> {
        let (can_start, reason) = self.can_start_sync().await?;
        if !can_start {
            return Ok(BackgroundSyncResult::already_running(
                reason.unwrap_or_else(|| already_running_reason(None)),
            ));
        }

        let Some(runner) = self.runner.clone() else {
            return Ok(BackgroundSyncResult::failed(NOT_INITIALIZED_MESSAGE));
        };

        // Correct a status row left behind by a crashed run before reusing it.
        self.get_status().await?;

        let mut lock = SyncLock::new(&self.lock_path);
        if lock.is_stale() {
            info!(path = %self.lock_path.display(), "Reclaiming stale sync lock");
        }
        if !lock.try_acquire()? {
            return Ok(BackgroundSyncResult::already_running(already_running_reason(
                lock.holder_pid(),
            )));
        }

        let pid = std::process::id();
        self.storage.start_background_sync(pid).await?;
        let guard = RunGuard {
            storage: self.storage.clone(),
            lock: Some(lock),
        };
        info!(pid, ?sources, ?max_sessions, compact, "Background sync started");

        let request = SyncRequest {
            sources,
            max_sessions,
            ..Default::default()
        };
        let work = async {
            if compact {
                runner.sync_and_compact(&request, false).await
            } else {
                runner.sync(&request).await
            }
        };
        let outcome = match &self.cancel {
            Some(cancel) => {
                let mut cancel = cancel.clone();
                tokio::select! {
                    outcome = work => outcome,
                    _ = wait_cancelled(&mut cancel) => Err(Error::Other(CANCELLED_MESSAGE.into())),
                }
            }
            None => work.await,
        };
        let lock = guard.disarm();

        let result = match outcome {
            Ok(report) => {
                self.storage
                    .complete_background_sync(
                        report.sessions_processed as i64,
                        report.learnings_extracted as i64,
                        None,
                    )
                    .await?;
                info!(
                    sessions = report.sessions_processed,
                    learnings = report.learnings_extracted,
                    "Background sync finished"
                );
                BackgroundSyncResult {
                    success: true,
                    sessions_processed: report.sessions_processed,
                    learnings_extracted: report.learnings_extracted,
                    ..Default::default()
                }
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, "Background sync failed");
                self.storage
                    .complete_background_sync(0, 0, Some(message.clone()))
                    .await?;
                BackgroundSyncResult::failed(message)
            }
        };

        if let Some(mut lock) = lock {
            lock.release();
        }
        Ok(result)
    }

    /// Clear the lock file if its holder is dead.
    pub fn cleanup_stale_lock(&self) -> Result<bool> {
        SyncLock::new(&self.lock_path).cleanup_stale()
    }
}

/// Owns the sync lock while a run is in flight. Dropped without
/// [`RunGuard::disarm`] (the `run_sync` future was abandoned), it records a
/// cancelled terminal status and only then releases the lock.
struct RunGuard {
    storage: Arc<dyn Storage>,
    lock: Option<SyncLock>,
}

impl RunGuard {
    fn disarm(mut self) -> Option<SyncLock> {
        self.lock.take()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        warn!("Background sync abandoned before finishing");
        let storage = self.storage.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(err) = storage
                        .complete_background_sync(0, 0, Some(CANCELLED_MESSAGE.to_string()))
                        .await
                    {
                        warn!(error = %err, "Failed to record cancelled sync");
                    }
                    drop(lock);
                });
            }
            // The next get_status() heals the row once the lock is gone.
            Err(_) => warn!("No runtime to record cancelled sync"),
        }
    }
}

fn already_running_reason(pid: Option<u32>) -> String {
    match pid {
        Some(pid) => format!("Sync already running (PID: {pid})"),
        None => "Sync already running (PID: unknown)".to_string(),
    }
}
