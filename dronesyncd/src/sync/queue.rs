use std::collections::VecDeque;
use std::path::PathBuf;

use dronesync_core::ProgressFn;
use thiserror::Error;

use super::error::EngineError;
use super::media::Media;

/// Called once per request with the final outcome of its transfer.
pub type CompletionFn = Box<dyn FnOnce(&Media, Result<PathBuf, EngineError>) + Send + 'static>;

pub struct DownloadRequest {
    pub media: Media,
    pub on_progress: Option<ProgressFn>,
    pub on_complete: Option<CompletionFn>,
}

impl DownloadRequest {
    pub fn new(media: Media) -> Self {
        Self {
            media,
            on_progress: None,
            on_complete: None,
        }
    }

    /// Reports `result` to the completion callback, if any.
    pub fn complete(self, result: Result<PathBuf, EngineError>) {
        if let Some(on_complete) = self.on_complete {
            on_complete(&self.media, result);
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("download queue is empty")]
    Empty,
}

#[derive(Default)]
pub struct DownloadQueue {
    inner: VecDeque<DownloadRequest>,
}

impl DownloadQueue {
    pub fn enqueue(&mut self, request: DownloadRequest) {
        self.inner.push_back(request);
    }

    pub fn dequeue(&mut self) -> Result<DownloadRequest, QueueError> {
        self.inner.pop_front().ok_or(QueueError::Empty)
    }

    /// Takes the oldest pending request matching `pred`.
    pub fn remove_first<F>(&mut self, pred: F) -> Option<DownloadRequest>
    where
        F: Fn(&Media) -> bool,
    {
        let index = self.inner.iter().position(|req| pred(&req.media))?;
        self.inner.remove(index)
    }

    /// Takes every pending request, oldest first.
    pub fn drain(&mut self) -> Vec<DownloadRequest> {
        self.inner.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn request(name: &str) -> DownloadRequest {
        DownloadRequest::new(Media::new("Bebop", name))
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue = DownloadQueue::default();
        queue.enqueue(request("a.jpg"));
        queue.enqueue(request("b.mp4"));

        let first = queue.dequeue().unwrap();
        let second = queue.dequeue().unwrap();

        assert_eq!(first.media.name, "a.jpg");
        assert_eq!(second.media.name, "b.mp4");
        assert!(queue.is_empty());
    }

    #[test]
    fn dequeue_on_empty_returns_error() {
        let mut queue = DownloadQueue::default();
        assert!(matches!(queue.dequeue(), Err(QueueError::Empty)));
    }

    #[test]
    fn remove_first_skips_non_matching_requests() {
        let mut queue = DownloadQueue::default();
        queue.enqueue(request("a.jpg"));
        queue.enqueue(request("b.jpg"));

        let removed = queue.remove_first(|m| m.name == "b.jpg").unwrap();

        assert_eq!(removed.media.name, "b.jpg");
        assert_eq!(queue.len(), 1);
        assert!(queue.remove_first(|m| m.name == "zzz").is_none());
    }

    #[test]
    fn drain_empties_and_completion_sees_outcome() {
        let mut queue = DownloadQueue::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["a.jpg", "b.jpg"] {
            let sink = Arc::clone(&seen);
            let mut req = request(name);
            let done: CompletionFn =
                Box::new(move |media: &Media, result: Result<PathBuf, EngineError>| {
                    sink.lock()
                        .unwrap()
                        .push((media.name.clone(), result.is_err()));
                });
            req.on_complete = Some(done);
            queue.enqueue(req);
        }

        for req in queue.drain() {
            req.complete(Err(EngineError::Canceled));
        }

        assert_eq!(queue.len(), 0);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("a.jpg".to_string(), true), ("b.jpg".to_string(), true)]
        );
    }
}
