use std::io;
use std::path::{Path, PathBuf};

use dronesync_core::{CancelSignal, ProgressFn, Transport, TransportError};

use super::error::EngineError;
use super::paths::{checked_name, fetched_record_for, marked, remote_join};

/// Where one remote file is pulled from and where its local copy lands.
#[derive(Debug, Clone, Copy)]
pub struct TransferTarget<'a> {
    /// Remote directory that holds the file.
    pub remote_dir: &'a str,
    /// Local directory that receives the file.
    pub local_dir: &'a Path,
    /// Committed name, without the downloading marker.
    pub name: &'a str,
}

impl TransferTarget<'_> {
    pub fn remote_claimed(&self) -> String {
        remote_join(self.remote_dir, &marked(self.name))
    }

    pub fn remote_original(&self) -> String {
        remote_join(self.remote_dir, self.name)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.local_dir.join(marked(self.name))
    }

    pub fn final_path(&self) -> PathBuf {
        self.local_dir.join(self.name)
    }

    pub fn fetched_record(&self) -> PathBuf {
        fetched_record_for(&self.staging_path())
    }
}

/// Claim, fetch, clean up, commit.
///
/// The remote rename to the marked name is the claim; the local rename from
/// the marked name is the commit. Anything found under the marked name on
/// either side is an unfinished transfer that can be picked up again with
/// [`TransferProtocol::resume`]. Cancellation is checked before the claim
/// and before and after the fetch. Remote cleanup and commit run back to back
/// so a completed fetch is never left uncommitted by a cancel.
///
/// Before the remote copy is deleted, the staging length is written to a
/// fetched record. A staging file whose remote marker is gone is only known
/// to be whole when that record matches it (see [`is_fetched`]).
pub struct TransferProtocol<'a> {
    transport: &'a dyn Transport,
    signal: &'a CancelSignal,
}

impl<'a> TransferProtocol<'a> {
    pub fn new(transport: &'a dyn Transport, signal: &'a CancelSignal) -> Self {
        Self { transport, signal }
    }

    /// Claims an unmarked remote file and takes it through to commit.
    pub async fn download(
        &self,
        target: TransferTarget<'_>,
        progress: Option<ProgressFn>,
    ) -> Result<PathBuf, EngineError> {
        self.claim(target).await?;
        self.finish(target, progress).await
    }

    /// Renames the remote file to its marked name.
    pub async fn claim(&self, target: TransferTarget<'_>) -> Result<(), EngineError> {
        checked_name(target.name)?;
        self.checkpoint()?;
        self.transport
            .rename(&target.remote_original(), &target.remote_claimed())
            .await?;
        tracing::debug!(name = target.name, dir = target.remote_dir, "claimed remote file");
        Ok(())
    }

    /// Continues a transfer whose remote file already carries the marker.
    pub async fn resume(
        &self,
        target: TransferTarget<'_>,
        progress: Option<ProgressFn>,
    ) -> Result<PathBuf, EngineError> {
        checked_name(target.name)?;
        self.checkpoint()?;
        self.finish(target, progress).await
    }

    async fn finish(
        &self,
        target: TransferTarget<'_>,
        progress: Option<ProgressFn>,
    ) -> Result<PathBuf, EngineError> {
        let claimed = target.remote_claimed();
        let staging = target.staging_path();
        tokio::fs::create_dir_all(target.local_dir).await?;
        self.transport
            .get(&claimed, &staging, true, progress)
            .await?;
        self.checkpoint()?;

        let record = target.fetched_record();
        record_fetched(&staging, &record).await?;
        match self.transport.delete(&claimed).await {
            Ok(()) | Err(TransportError::NotFound(_)) => {}
            Err(err) => {
                // The remote marker stays behind; the next pass resumes it and
                // overwrites this commit with an identical copy.
                tracing::warn!(name = target.name, error = %err, "remote cleanup failed");
            }
        }
        let committed = commit(&staging, &target.final_path()).await?;
        discard_record(&record).await;
        Ok(committed)
    }

    fn checkpoint(&self) -> Result<(), EngineError> {
        if self.signal.is_cancelled() {
            return Err(EngineError::Canceled);
        }
        Ok(())
    }
}

/// Renames a fully fetched staging file to its final name.
pub async fn commit(staging: &Path, final_path: &Path) -> Result<PathBuf, EngineError> {
    tokio::fs::rename(staging, final_path).await?;
    tracing::info!(path = %final_path.display(), "committed file");
    Ok(final_path.to_path_buf())
}

async fn record_fetched(staging: &Path, record: &Path) -> Result<(), EngineError> {
    let len = tokio::fs::metadata(staging).await?.len();
    tokio::fs::write(record, len.to_string()).await?;
    Ok(())
}

/// Whether `record` vouches for the current length of `staging`.
pub async fn is_fetched(staging: &Path, record: &Path) -> Result<bool, EngineError> {
    let recorded = match tokio::fs::read_to_string(record).await {
        Ok(text) => text.trim().parse::<u64>().ok(),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    let actual = tokio::fs::metadata(staging).await?.len();
    Ok(recorded == Some(actual))
}

/// Removes a fetched record that no longer has a staging file to vouch for.
pub async fn discard_record(record: &Path) {
    match tokio::fs::remove_file(record).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(
                path = %record.display(),
                error = %err,
                "could not remove fetched record"
            );
        }
    }
}
