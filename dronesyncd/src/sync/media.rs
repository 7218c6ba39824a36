use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dronesync_core::{
    CancelSignal, Connector, ProgressFn, RemoteEntry, Transport, TransportError,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::error::EngineError;
use super::paths::{checked_name, is_marked, local_dir_for, marked, remote_join, unmarked};
use super::queue::{CompletionFn, DownloadQueue, DownloadRequest};
use super::transfer::{TransferProtocol, TransferTarget};
use super::worker::{DEFAULT_REMOTE_ROOT, select_categories};

pub const DEFAULT_MEDIA_FOLDER: &str = "media";
pub const DEFAULT_THUMB_FOLDER: &str = "thumb";
const THUMB_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConfig {
    pub remote_root: String,
    pub media_folder: String,
    pub thumb_folder: String,
    /// Empty means every directory at the remote root.
    pub categories: Vec<String>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            remote_root: DEFAULT_REMOTE_ROOT.to_string(),
            media_folder: DEFAULT_MEDIA_FOLDER.to_string(),
            thumb_folder: DEFAULT_THUMB_FOLDER.to_string(),
            categories: Vec::new(),
        }
    }
}

impl MediaConfig {
    fn validate(&self) -> Result<(), EngineError> {
        checked_name(&self.media_folder)?;
        checked_name(&self.thumb_folder)?;
        for category in &self.categories {
            checked_name(category)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Thumbnail {
    #[default]
    NotFetched,
    Available(Vec<u8>),
    /// The device has no thumbnail for this media.
    Missing,
}

/// One media file listed on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub category: String,
    /// Name without the downloading marker.
    pub name: String,
    /// Name as listed; carries the marker when an earlier download was cut
    /// short after the claim.
    pub remote_name: String,
    pub size: Option<u64>,
    pub modified: Option<i64>,
    pub thumbnail: Thumbnail,
}

impl Media {
    pub fn new(category: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            category: category.into(),
            remote_name: name.clone(),
            name,
            size: None,
            modified: None,
            thumbnail: Thumbnail::NotFetched,
        }
    }

    fn from_entry(category: &str, entry: &RemoteEntry) -> Self {
        Self {
            category: category.to_string(),
            name: unmarked(&entry.name).to_string(),
            remote_name: entry.name.clone(),
            size: entry.size,
            modified: entry.modified,
            thumbnail: Thumbnail::NotFetched,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        is_marked(&self.remote_name)
    }

    fn same_media(&self, other: &Media) -> bool {
        self.category == other.category && self.name == other.name
    }
}

/// Lists media on the device and downloads them one at a time from a FIFO
/// queue on a background task.
///
/// Listing, transfers and deletions each use their own connection. Listing is
/// canceled with [`cancel_listing`](Self::cancel_listing), which also covers
/// thumbnail requests. The queue is canceled with
/// [`cancel_queue`](Self::cancel_queue) and the background task with
/// [`cancel`](Self::cancel).
pub struct MediaDownloader {
    shared: Arc<MediaShared>,
    task: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
}

struct MediaShared {
    config: MediaConfig,
    local_root: PathBuf,
    connector: Arc<dyn Connector>,
    list_transport: Arc<dyn Transport>,
    list_signal: CancelSignal,
    transfer_transport: Arc<dyn Transport>,
    queue_signal: CancelSignal,
    delete_transport: Arc<dyn Transport>,
    thread_signal: CancelSignal,
    medias: tokio::sync::Mutex<Vec<Media>>,
    queue: tokio::sync::Mutex<DownloadQueue>,
    queue_wake: Notify,
    running: AtomicBool,
}

impl MediaDownloader {
    pub async fn new(
        connector: Arc<dyn Connector>,
        local_directory: &Path,
        config: MediaConfig,
    ) -> Result<Self, EngineError> {
        if local_directory.as_os_str().is_empty() {
            return Err(EngineError::InvalidArgument(
                "local directory is empty".to_string(),
            ));
        }
        config.validate()?;
        tokio::fs::create_dir_all(local_directory).await?;

        let list_signal = CancelSignal::new();
        let queue_signal = CancelSignal::new();
        let list_transport = connector.connect(list_signal.clone()).await?;
        let transfer_transport = connector.connect(queue_signal.clone()).await?;
        let delete_transport = connector.connect(CancelSignal::new()).await?;
        tracing::info!(local_root = %local_directory.display(), "media downloader ready");

        Ok(Self {
            shared: Arc::new(MediaShared {
                config,
                local_root: local_directory.to_path_buf(),
                connector,
                list_transport,
                list_signal,
                transfer_transport,
                queue_signal,
                delete_transport,
                thread_signal: CancelSignal::new(),
                medias: tokio::sync::Mutex::new(Vec::new()),
                queue: tokio::sync::Mutex::new(DownloadQueue::default()),
                queue_wake: Notify::new(),
                running: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        })
    }

    pub fn local_root(&self) -> &Path {
        &self.shared.local_root
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Replaces the collection with a fresh device listing and returns a copy.
    /// On failure the previous collection is kept.
    pub async fn refresh_listing(
        &self,
        with_thumbnails: bool,
    ) -> Result<Vec<Media>, EngineError> {
        self.shared.list_signal.reset();
        let listed = self.shared.list_medias(with_thumbnails).await?;
        tracing::info!(count = listed.len(), "media listing refreshed");
        let mut medias = self.shared.medias.lock().await;
        *medias = listed;
        Ok(medias.clone())
    }

    pub fn cancel_listing(&self) {
        self.shared.list_signal.cancel();
    }

    /// Copy of the current collection.
    pub async fn medias(&self) -> Vec<Media> {
        self.shared.medias.lock().await.clone()
    }

    /// Fetches the thumbnail of a listed media over a short-lived connection
    /// and stores it in the collection. [`cancel_listing`](Self::cancel_listing)
    /// aborts the fetch.
    pub async fn get_thumbnail(&self, media: &Media) -> Result<Thumbnail, EngineError> {
        let current = self.shared.listed(media).await?;
        self.shared.list_signal.reset();
        let transport = self
            .shared
            .connector
            .connect(self.shared.list_signal.clone())
            .await?;
        let thumbnail = self
            .shared
            .fetch_thumbnail(transport.as_ref(), &current)
            .await?;

        let mut medias = self.shared.medias.lock().await;
        let entry = medias
            .iter_mut()
            .find(|m| m.same_media(media))
            .ok_or_else(|| EngineError::MediaNotFound(media.name.clone()))?;
        entry.thumbnail = thumbnail.clone();
        Ok(thumbnail)
    }

    /// Queues a listed media for download.
    pub async fn enqueue(
        &self,
        media: &Media,
        on_progress: Option<ProgressFn>,
        on_complete: Option<CompletionFn>,
    ) -> Result<(), EngineError> {
        let current = self.shared.listed(media).await?;
        tracing::debug!(category = %current.category, name = %current.name, "media queued");
        self.shared.queue.lock().await.enqueue(DownloadRequest {
            media: current,
            on_progress,
            on_complete,
        });
        self.shared.queue_wake.notify_one();
        Ok(())
    }

    /// Withdraws a request that has not started yet; its completion callback
    /// receives [`EngineError::Canceled`].
    pub async fn dequeue(&self, media: &Media) -> Result<(), EngineError> {
        let request = self
            .shared
            .queue
            .lock()
            .await
            .remove_first(|queued| queued.same_media(media))
            .ok_or_else(|| EngineError::MediaNotFound(media.name.clone()))?;
        request.complete(Err(EngineError::Canceled));
        Ok(())
    }

    pub async fn queued_count(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Drops a media from the collection without touching the device.
    pub async fn remove_from_list(&self, media: &Media) -> Result<Media, EngineError> {
        self.shared
            .forget(media)
            .await
            .ok_or_else(|| EngineError::MediaNotFound(media.name.clone()))
    }

    /// Deletes a media and its thumbnail on the device, then drops it from the
    /// collection.
    pub async fn delete_media(&self, media: &Media) -> Result<(), EngineError> {
        let current = self.shared.listed(media).await?;
        let shared = &self.shared;
        let remote = remote_join(&shared.media_dir(&current.category), &current.remote_name);
        shared.delete_transport.delete(&remote).await?;

        match shared
            .delete_transport
            .delete(&shared.thumb_path(&current))
            .await
        {
            Ok(()) | Err(TransportError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(name = %current.name, error = %err, "could not delete thumbnail");
            }
        }
        shared.forget(&current).await;
        tracing::info!(category = %current.category, name = %current.name, "media deleted");
        Ok(())
    }

    /// Aborts the in-flight transfer and completes every queued request with
    /// [`EngineError::Canceled`]. Requests enqueued after this returns are
    /// processed normally.
    pub async fn cancel_queue(&self) {
        let pending = {
            let mut queue = self.shared.queue.lock().await;
            self.shared.queue_signal.cancel();
            queue.drain()
        };
        complete_canceled(pending);
        if !self.is_running() {
            self.shared.queue_signal.reset();
        }
    }

    pub fn start(&self) -> Result<(), EngineError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRunning);
        }
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let result = shared.run_queue().await;
            shared.running.store(false, Ordering::SeqCst);
            result
        });
        *self.lock_task() = Some(handle);
        Ok(())
    }

    /// Stops the background task, aborting any transfer in flight. Requests
    /// still queued are completed with [`EngineError::Canceled`].
    pub fn cancel(&self) {
        self.shared.thread_signal.cancel();
        self.shared.queue_signal.cancel();
    }

    pub async fn join(&self) -> Result<(), EngineError> {
        let handle = self.lock_task().take();
        match handle {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<Result<(), EngineError>>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MediaShared {
    fn media_dir(&self, category: &str) -> String {
        remote_join(
            &remote_join(&self.config.remote_root, category),
            &self.config.media_folder,
        )
    }

    fn thumb_path(&self, media: &Media) -> String {
        let dir = remote_join(
            &remote_join(&self.config.remote_root, &media.category),
            &self.config.thumb_folder,
        );
        remote_join(&dir, &format!("{}.{THUMB_EXTENSION}", media.name))
    }

    async fn list_medias(&self, with_thumbnails: bool) -> Result<Vec<Media>, EngineError> {
        let root_entries = self.list_transport.list(&self.config.remote_root).await?;
        let mut medias: Vec<Media> = Vec::new();
        for category in select_categories(&self.config.categories, &root_entries) {
            let entries = match self.list_transport.list(&self.media_dir(&category)).await {
                Ok(entries) => entries,
                Err(TransportError::NotFound(_)) => continue,
                Err(err) => return Err(err.into()),
            };
            medias.try_reserve(entries.len())?;
            medias.extend(
                entries
                    .iter()
                    .filter(|entry| entry.is_file())
                    .map(|entry| Media::from_entry(&category, entry)),
            );
        }

        if with_thumbnails {
            for media in &mut medias {
                media.thumbnail = self
                    .fetch_thumbnail(self.list_transport.as_ref(), media)
                    .await?;
            }
        }
        Ok(medias)
    }

    async fn fetch_thumbnail(
        &self,
        transport: &dyn Transport,
        media: &Media,
    ) -> Result<Thumbnail, EngineError> {
        match transport.get_bytes(&self.thumb_path(media)).await {
            Ok(bytes) => Ok(Thumbnail::Available(bytes)),
            Err(TransportError::NotFound(_)) => Ok(Thumbnail::Missing),
            Err(err) => Err(err.into()),
        }
    }

    /// Current collection entry for `media`.
    async fn listed(&self, media: &Media) -> Result<Media, EngineError> {
        self.medias
            .lock()
            .await
            .iter()
            .find(|m| m.same_media(media))
            .cloned()
            .ok_or_else(|| EngineError::MediaNotFound(media.name.clone()))
    }

    async fn forget(&self, media: &Media) -> Option<Media> {
        let mut medias = self.medias.lock().await;
        let index = medias.iter().position(|m| m.same_media(media))?;
        Some(medias.remove(index))
    }

    /// Points the collection entry at the marked remote name once claimed.
    async fn mark_claimed(&self, media: &Media) {
        let mut medias = self.medias.lock().await;
        if let Some(entry) = medias.iter_mut().find(|m| m.same_media(media)) {
            entry.remote_name = marked(&entry.name);
        }
    }

    async fn cancel_pending(&self) {
        let pending = self.queue.lock().await.drain();
        complete_canceled(pending);
    }

    async fn run_queue(&self) -> Result<(), EngineError> {
        if self.thread_signal.reset() {
            self.queue_signal.reset();
            self.cancel_pending().await;
            tracing::info!("media downloader canceled before start");
            return Err(EngineError::Canceled);
        }
        tracing::info!("media downloader started");

        loop {
            if self.thread_signal.is_cancelled() {
                break;
            }
            let next = {
                let mut queue = self.queue.lock().await;
                // cancel_queue drains under this lock, so whatever is queued
                // now was enqueued after the last queue cancel.
                self.queue_signal.reset();
                if self.thread_signal.is_cancelled() {
                    self.queue_signal.cancel();
                    break;
                }
                queue.dequeue().ok()
            };
            match next {
                Some(request) => self.download(request).await,
                None => {
                    tokio::select! {
                        _ = self.thread_signal.cancelled() => break,
                        _ = self.queue_wake.notified() => {}
                    }
                }
            }
        }

        self.cancel_pending().await;
        self.thread_signal.reset();
        self.queue_signal.reset();
        tracing::info!("media downloader stopped");
        Ok(())
    }

    async fn download(&self, mut request: DownloadRequest) {
        // The collection tracks claims made since this request was queued.
        let media = self
            .listed(&request.media)
            .await
            .unwrap_or_else(|_| request.media.clone());
        let progress = request.on_progress.take();
        let result = self.transfer(&media, progress).await;
        match &result {
            Ok(path) => {
                self.forget(&media).await;
                tracing::info!(
                    category = %media.category,
                    path = %path.display(),
                    "media downloaded"
                );
            }
            Err(err) if err.is_canceled() => {
                tracing::info!(name = %media.name, "media download canceled");
            }
            Err(err) => {
                tracing::warn!(name = %media.name, error = %err, "media download failed");
            }
        }
        request.complete(result);
    }

    async fn transfer(
        &self,
        media: &Media,
        progress: Option<ProgressFn>,
    ) -> Result<PathBuf, EngineError> {
        let remote_dir = self.media_dir(&media.category);
        let local_dir = local_dir_for(&self.local_root, &media.category)?;
        let protocol = TransferProtocol::new(self.transfer_transport.as_ref(), &self.queue_signal);
        let target = TransferTarget {
            remote_dir: &remote_dir,
            local_dir: &local_dir,
            name: &media.name,
        };
        if !media.is_in_progress() {
            protocol.claim(target).await?;
            self.mark_claimed(media).await;
        }
        protocol.resume(target, progress).await
    }
}

fn complete_canceled(pending: Vec<DownloadRequest>) {
    if !pending.is_empty() {
        tracing::info!(count = pending.len(), "queued media canceled");
    }
    for request in pending {
        request.complete(Err(EngineError::Canceled));
    }
}

#[cfg(test)]
#[path = "media_tests.rs"]
mod tests;
