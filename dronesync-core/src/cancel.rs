use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;

/// A cancellation signal shared between a controller and the connections it
/// owns.
///
/// Each generation is a [`CancellationToken`]. `cancel` trips the current
/// generation; `reset` arms a fresh one once the canceled work has wound down,
/// so the same signal can be handed to a connection once and reused across
/// many operations.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal {
    current: Arc<Mutex<CancellationToken>>,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.lock().cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().is_cancelled()
    }

    /// Token for the current generation.
    pub fn token(&self) -> CancellationToken {
        self.lock().clone()
    }

    /// Re-arms the signal. Returns `true` if a canceled generation was replaced.
    pub fn reset(&self) -> bool {
        let mut current = self.lock();
        if current.is_cancelled() {
            *current = CancellationToken::new();
            true
        } else {
            false
        }
    }

    /// Resolves once the current generation is canceled.
    pub async fn cancelled(&self) {
        self.token().cancelled_owned().await;
    }

    /// Runs `fut` unless the current generation is canceled first.
    pub async fn guard<T, F>(&self, fut: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        let token = self.token();
        if token.is_cancelled() {
            return Err(TransportError::Canceled);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransportError::Canceled),
            res = fut => res,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_only_replaces_canceled_generation() {
        let signal = CancelSignal::new();
        assert!(!signal.reset());

        let before = signal.token();
        signal.cancel();
        assert!(before.is_cancelled());
        assert!(signal.is_cancelled());

        assert!(signal.reset());
        assert!(!signal.is_cancelled());
        assert!(before.is_cancelled());
    }

    #[test]
    fn clones_share_the_generation() {
        let signal = CancelSignal::new();
        let other = signal.clone();
        other.cancel();
        assert!(signal.is_cancelled());
        signal.reset();
        assert!(!other.is_cancelled());
    }

    #[tokio::test]
    async fn guard_refuses_work_after_cancel() {
        let signal = CancelSignal::new();
        signal.cancel();
        let res = signal.guard(async { Ok::<_, TransportError>(1) }).await;
        assert!(matches!(res, Err(TransportError::Canceled)));
    }

    #[tokio::test]
    async fn guard_aborts_pending_future() {
        let signal = CancelSignal::new();
        let canceller = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let res = signal
            .guard(async {
                std::future::pending::<()>().await;
                Ok::<_, TransportError>(())
            })
            .await;
        assert!(matches!(res, Err(TransportError::Canceled)));
    }
}
