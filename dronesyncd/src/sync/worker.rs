use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dronesync_core::{CancelSignal, Connector, RemoteEntry, Transport};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::error::EngineError;
use super::paths::{
    checked_name, fetched_record_for, is_fetched_record, is_marked, local_dir_for, remote_join,
    unmarked,
};
use super::quota::{self, DEFAULT_SPACE_PERCENT, SweepOutcome};
use super::transfer::{TransferProtocol, TransferTarget, commit, discard_record, is_fetched};

pub const DEFAULT_REMOTE_ROOT: &str = "/";
pub const DEFAULT_DATA_FOLDER: &str = "academy";
pub const DEFAULT_POLL_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub remote_root: String,
    /// Subfolder of every category holding the data files. Also the name of
    /// the local directory created under the caller's local directory.
    pub data_folder: String,
    /// Fixed processing order. Empty means every directory at the remote
    /// root, sorted by name.
    pub categories: Vec<String>,
    pub poll_interval: Duration,
    pub space_percent: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
            data_folder: DEFAULT_DATA_FOLDER.to_string(),
            categories: Vec::new(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            space_percent: DEFAULT_SPACE_PERCENT,
        }
    }
}

impl SyncConfig {
    fn validate(&self) -> Result<(), EngineError> {
        checked_name(&self.data_folder)?;
        for category in &self.categories {
            checked_name(category)?;
        }
        if !(0.0..=100.0).contains(&self.space_percent) {
            return Err(EngineError::InvalidArgument(format!(
                "space percent out of range: {}",
                self.space_percent
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassReport {
    /// Transfers continued from an earlier claim.
    pub resumed: usize,
    /// Fresh remote files claimed during this pass.
    pub claimed: usize,
    pub committed: usize,
    /// Local staging files committed after their remote copy was already
    /// cleaned up.
    pub recovered: usize,
    pub failed: usize,
    pub canceled: bool,
    pub quota: Option<SweepOutcome>,
}

/// Background worker mirroring every category's data folder into the local
/// root, then trimming the local root to its space budget.
pub struct DataDownloader {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
}

struct Shared {
    config: SyncConfig,
    local_root: PathBuf,
    transport: Arc<dyn Transport>,
    signal: CancelSignal,
    wake: Notify,
    running: AtomicBool,
}

impl DataDownloader {
    /// Creates `<local_directory>/<data_folder>` and opens the connection.
    pub async fn new(
        connector: &dyn Connector,
        local_directory: &Path,
        config: SyncConfig,
    ) -> Result<Self, EngineError> {
        if local_directory.as_os_str().is_empty() {
            return Err(EngineError::InvalidArgument(
                "local directory is empty".to_string(),
            ));
        }
        config.validate()?;
        let local_root = local_directory.join(&config.data_folder);
        tokio::fs::create_dir_all(&local_root).await?;

        let signal = CancelSignal::new();
        let transport = connector.connect(signal.clone()).await?;
        tracing::info!(local_root = %local_root.display(), "data downloader ready");

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                local_root,
                transport,
                signal,
                wake: Notify::new(),
                running: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        })
    }

    pub fn local_root(&self) -> &Path {
        &self.shared.local_root
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.signal.is_cancelled()
    }

    /// Spawns the sync loop on the current runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let result = shared.run_loop().await;
            shared.running.store(false, Ordering::SeqCst);
            result
        });
        *self.lock_task() = Some(handle);
        Ok(())
    }

    /// Stops the loop at its next checkpoint and aborts in-flight transport
    /// calls. When issued before `start`, the next start exits immediately.
    pub fn cancel(&self) {
        tracing::debug!("data downloader cancel requested");
        self.shared.signal.cancel();
    }

    /// Cuts the current wait short without canceling.
    pub fn sync_now(&self) {
        self.shared.wake.notify_one();
    }

    /// Waits for the loop started by `start` to exit.
    pub async fn join(&self) -> Result<(), EngineError> {
        let handle = self.lock_task().take();
        match handle {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }

    /// Runs a single pass on the caller's task.
    pub async fn run_pass(&self) -> Result<PassReport, EngineError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        let report = self.shared.run_pass().await;
        self.shared.running.store(false, Ordering::SeqCst);
        if report.canceled {
            self.shared.signal.reset();
        }
        Ok(report)
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<Result<(), EngineError>>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Shared {
    async fn run_loop(&self) -> Result<(), EngineError> {
        if self.signal.reset() {
            tracing::info!("data downloader canceled before start");
            return Err(EngineError::Canceled);
        }
        tracing::info!(
            remote_root = %self.config.remote_root,
            poll_secs = self.config.poll_interval.as_secs(),
            "data downloader started"
        );

        loop {
            let report = self.run_pass().await;
            if report.canceled || self.signal.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = self.signal.cancelled() => break,
                _ = self.wake.notified() => tracing::debug!("woken for next pass"),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.signal.reset();
        tracing::info!("data downloader stopped");
        Ok(())
    }

    async fn run_pass(&self) -> PassReport {
        let mut report = PassReport::default();
        match self.sync_categories(&mut report).await {
            Ok(()) => {}
            Err(EngineError::Canceled) => report.canceled = true,
            Err(err) => tracing::warn!(error = %err, "sync pass aborted"),
        }

        if !report.canceled {
            match quota::enforce(&self.local_root, self.config.space_percent).await {
                Ok(outcome) => report.quota = Some(outcome),
                Err(err) => tracing::warn!(error = %err, "quota sweep failed"),
            }
        }

        tracing::info!(
            resumed = report.resumed,
            claimed = report.claimed,
            committed = report.committed,
            recovered = report.recovered,
            failed = report.failed,
            canceled = report.canceled,
            "sync pass finished"
        );
        report
    }

    async fn sync_categories(&self, report: &mut PassReport) -> Result<(), EngineError> {
        self.checkpoint()?;
        let root_entries = self.transport.list(&self.config.remote_root).await?;
        for category in select_categories(&self.config.categories, &root_entries) {
            self.checkpoint()?;
            self.sync_category(&category, report).await?;
        }
        Ok(())
    }

    async fn sync_category(
        &self,
        category: &str,
        report: &mut PassReport,
    ) -> Result<(), EngineError> {
        let remote_dir = remote_join(
            &remote_join(&self.config.remote_root, category),
            &self.config.data_folder,
        );
        let local_dir = local_dir_for(&self.local_root, category)?;
        let entries = self.transport.list(&remote_dir).await?;

        let (claimed, fresh): (Vec<_>, Vec<_>) = entries
            .iter()
            .filter(|entry| entry.is_file())
            .partition(|entry| is_marked(&entry.name));

        let remote_claimed: HashSet<&str> = claimed.iter().map(|e| e.name.as_str()).collect();
        self.recover_orphans(&local_dir, &remote_claimed, report)
            .await?;

        let protocol = TransferProtocol::new(self.transport.as_ref(), &self.signal);
        for entry in claimed {
            self.checkpoint()?;
            let target = TransferTarget {
                remote_dir: &remote_dir,
                local_dir: &local_dir,
                name: unmarked(&entry.name),
            };
            match protocol.resume(target, None).await {
                Ok(_) => {
                    report.resumed += 1;
                    report.committed += 1;
                }
                Err(EngineError::Canceled) => return Err(EngineError::Canceled),
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(category, name = %entry.name, error = %err, "resume failed");
                }
            }
        }

        for entry in fresh {
            self.checkpoint()?;
            let target = TransferTarget {
                remote_dir: &remote_dir,
                local_dir: &local_dir,
                name: &entry.name,
            };
            match protocol.download(target, None).await {
                Ok(_) => {
                    report.claimed += 1;
                    report.committed += 1;
                }
                Err(EngineError::Canceled) => return Err(EngineError::Canceled),
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(category, name = %entry.name, error = %err, "download failed");
                }
            }
        }
        Ok(())
    }

    /// Commits staging files whose remote marker is already gone and whose
    /// fetched record matches them. Staging files without such a record are
    /// partial and stay where they are.
    async fn recover_orphans(
        &self,
        local_dir: &Path,
        remote_claimed: &HashSet<&str>,
        report: &mut PassReport,
    ) -> Result<(), EngineError> {
        let mut reader = match tokio::fs::read_dir(local_dir).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut records = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_fetched_record(&name) {
                records.push(entry.path());
                continue;
            }
            if !is_marked(&name) || remote_claimed.contains(name.as_str()) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                continue;
            }

            let staging = entry.path();
            let record = fetched_record_for(&staging);
            match is_fetched(&staging, &record).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(name = %name, "orphaned staging file is partial, left staged");
                    continue;
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(name = %name, error = %err, "could not check staging file");
                    continue;
                }
            }
            match commit(&staging, &local_dir.join(unmarked(&name))).await {
                Ok(_) => {
                    report.recovered += 1;
                    report.committed += 1;
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(name = %name, error = %err, "could not commit staging file");
                }
            }
        }

        // Records outlive their staging file only when a commit succeeded.
        for record in records {
            let staging = record.with_extension("");
            if !tokio::fs::try_exists(&staging).await.unwrap_or(true) {
                discard_record(&record).await;
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), EngineError> {
        if self.signal.is_cancelled() {
            return Err(EngineError::Canceled);
        }
        Ok(())
    }
}

/// Categories to visit this pass, in processing order.
pub(super) fn select_categories(
    configured: &[String],
    root_entries: &[RemoteEntry],
) -> Vec<String> {
    let present: Vec<&str> = root_entries
        .iter()
        .filter(|entry| entry.is_dir())
        .map(|entry| entry.name.as_str())
        .collect();
    if configured.is_empty() {
        let mut all: Vec<String> = present.iter().map(|name| name.to_string()).collect();
        all.sort();
        return all;
    }
    configured
        .iter()
        .filter(|category| present.contains(&category.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
