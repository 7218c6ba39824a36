use std::io::{self, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::cancel::CancelSignal;
use crate::transport::{
    Connector, EntryKind, ProgressFn, ProgressReporter, RemoteEntry, Transport, TransportError,
};

const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// Connects to a directory standing in for the device's file server, such as
/// a device mounted over USB.
#[derive(Debug, Clone)]
pub struct LocalDirConnector {
    root: PathBuf,
}

impl LocalDirConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Connector for LocalDirConnector {
    async fn connect(&self, signal: CancelSignal) -> Result<Arc<dyn Transport>, TransportError> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|err| map_not_found(err, &self.root.to_string_lossy()))?;
        if !meta.is_dir() {
            return Err(TransportError::InvalidPath(
                self.root.to_string_lossy().into_owned(),
            ));
        }
        tracing::debug!(root = %self.root.display(), "opened directory transport");
        Ok(Arc::new(LocalDirTransport::new(self.root.clone(), signal)))
    }
}

pub struct LocalDirTransport {
    root: PathBuf,
    signal: CancelSignal,
}

impl LocalDirTransport {
    pub fn new(root: PathBuf, signal: CancelSignal) -> Self {
        Self { root, signal }
    }

    fn resolve(&self, remote_path: &str) -> Result<PathBuf, TransportError> {
        let mut out = self.root.clone();
        for component in Path::new(remote_path).components() {
            match component {
                Component::Normal(part) => out.push(part),
                Component::RootDir | Component::CurDir => continue,
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(TransportError::InvalidPath(remote_path.to_string()));
                }
            }
        }
        Ok(out)
    }

    async fn copy_into(
        &self,
        remote_path: &str,
        local_path: &Path,
        resume: bool,
        progress: Option<ProgressFn>,
    ) -> Result<(), TransportError> {
        let token = self.signal.token();
        if token.is_cancelled() {
            return Err(TransportError::Canceled);
        }
        let source_path = self.resolve(remote_path)?;
        let mut source = File::open(&source_path)
            .await
            .map_err(|err| map_not_found(err, remote_path))?;
        let total = source.metadata().await?.len();

        let mut offset = if resume {
            match tokio::fs::metadata(local_path).await {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
                Err(err) => return Err(err.into()),
            }
        } else {
            0
        };
        // A local file longer than the source cannot be a prefix of it.
        if offset > total {
            offset = 0;
        }

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut target = if offset > 0 {
            OpenOptions::new().append(true).open(local_path).await?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(local_path)
                .await?
        };

        let mut reporter = ProgressReporter::new(progress, Some(total));
        reporter.update(offset);
        source.seek(SeekFrom::Start(offset)).await?;

        let mut done = offset;
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        loop {
            if token.is_cancelled() {
                target.flush().await?;
                return Err(TransportError::Canceled);
            }
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            target.write_all(&buf[..n]).await?;
            done += n as u64;
            reporter.update(done);
        }
        target.flush().await?;
        target.sync_all().await?;
        reporter.finish();
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalDirTransport {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        self.signal
            .guard(async {
                let dir = self.resolve(path)?;
                let mut reader = tokio::fs::read_dir(&dir)
                    .await
                    .map_err(|err| map_not_found(err, path))?;
                let mut entries = Vec::new();
                while let Some(entry) = reader.next_entry().await? {
                    let meta = entry.metadata().await?;
                    let modified = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64);
                    entries.push(RemoteEntry {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        kind: if meta.is_dir() {
                            EntryKind::Dir
                        } else {
                            EntryKind::File
                        },
                        size: meta.is_file().then(|| meta.len()),
                        modified,
                    });
                }
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(entries)
            })
            .await
    }

    async fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        resume: bool,
        progress: Option<ProgressFn>,
    ) -> Result<(), TransportError> {
        self.copy_into(remote_path, local_path, resume, progress)
            .await
    }

    async fn get_bytes(&self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        self.signal
            .guard(async {
                let path = self.resolve(remote_path)?;
                tokio::fs::read(&path)
                    .await
                    .map_err(|err| map_not_found(err, remote_path))
            })
            .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.signal
            .guard(async {
                let source = self.resolve(from)?;
                let target = self.resolve(to)?;
                tokio::fs::rename(&source, &target)
                    .await
                    .map_err(|err| map_not_found(err, from))
            })
            .await
    }

    async fn delete(&self, path: &str) -> Result<(), TransportError> {
        self.signal
            .guard(async {
                let target = self.resolve(path)?;
                tokio::fs::remove_file(&target)
                    .await
                    .map_err(|err| map_not_found(err, path))
            })
            .await
    }
}

fn map_not_found(err: io::Error, path: &str) -> TransportError {
    if err.kind() == io::ErrorKind::NotFound {
        TransportError::NotFound(path.to_string())
    } else {
        TransportError::Io(err)
    }
}
