use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelSignal;

/// Invoked with a 0-100 percentage while a `get` is in flight.
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation canceled")]
    Canceled,
    #[error("remote path not found: {0}")]
    NotFound(String),
    #[error("invalid remote path: {0}")]
    InvalidPath(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// One object from a remote directory listing.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    #[serde(default)]
    pub size: Option<u64>,
    /// Unix seconds, when the server reports it.
    #[serde(default)]
    pub modified: Option<i64>,
}

impl RemoteEntry {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ConnectionParams {
    pub fn anonymous(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }
}

/// Primitive remote operations. Paths are POSIX-like strings relative to the
/// server root. Every operation aborts with [`TransportError::Canceled`] when
/// the signal the connection was created with is canceled.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError>;

    /// Downloads `remote_path` into `local_path`. With `resume`, an existing
    /// local file is extended from its current length instead of truncated.
    async fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        resume: bool,
        progress: Option<ProgressFn>,
    ) -> Result<(), TransportError>;

    /// Downloads a small object fully into memory.
    async fn get_bytes(&self, remote_path: &str) -> Result<Vec<u8>, TransportError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;

    async fn delete(&self, path: &str) -> Result<(), TransportError>;
}

/// Opens connections bound to a cancellation signal.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, signal: CancelSignal) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Tracks progress of one download and reports each whole-percent change once.
pub(crate) struct ProgressReporter {
    callback: Option<ProgressFn>,
    total: Option<u64>,
    last: Option<u8>,
}

impl ProgressReporter {
    pub(crate) fn new(callback: Option<ProgressFn>, total: Option<u64>) -> Self {
        Self {
            callback,
            total,
            last: None,
        }
    }

    pub(crate) fn update(&mut self, done: u64) {
        let Some(callback) = self.callback.as_ref() else {
            return;
        };
        let percent = match self.total {
            Some(0) => 100,
            Some(total) => (done.min(total).saturating_mul(100) / total) as u8,
            None => return,
        };
        if self.last != Some(percent) {
            self.last = Some(percent);
            callback(percent);
        }
    }

    pub(crate) fn finish(&mut self) {
        if let Some(callback) = self.callback.as_ref()
            && self.last != Some(100)
        {
            self.last = Some(100);
            callback(100);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (ProgressFn, Arc<Mutex<Vec<u8>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressFn = Arc::new(move |p: u8| sink.lock().unwrap().push(p));
        (callback, seen)
    }

    #[test]
    fn reports_each_percent_once() {
        let (callback, seen) = recorder();
        let mut reporter = ProgressReporter::new(Some(callback), Some(200));
        reporter.update(1);
        reporter.update(1);
        reporter.update(100);
        reporter.update(200);
        reporter.finish();
        assert_eq!(*seen.lock().unwrap(), vec![0, 50, 100]);
    }

    #[test]
    fn unknown_total_only_reports_completion() {
        let (callback, seen) = recorder();
        let mut reporter = ProgressReporter::new(Some(callback), None);
        reporter.update(10);
        reporter.finish();
        assert_eq!(*seen.lock().unwrap(), vec![100]);
    }

    #[test]
    fn deserializes_listing_entry() {
        let entry: RemoteEntry = serde_json::from_value(serde_json::json!({
            "name": "photo.jpg",
            "type": "file",
            "size": 12
        }))
        .unwrap();
        assert!(entry.is_file());
        assert_eq!(entry.size, Some(12));
        assert_eq!(entry.modified, None);
    }
}
