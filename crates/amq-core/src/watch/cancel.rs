//! Cancellation for blocking waits

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

use super::source::Signal;

/// Cloneable handle that aborts a running [`Watcher`](super::Watcher) wait.
///
/// Cancelling wakes the waiting loop through the same channel its change
/// source feeds, so the wait returns promptly rather than at the next tick.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    next_id: AtomicU64,
    wakers: Mutex<Vec<(u64, Sender<Signal>)>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        for (_, tx) in self.wakers().iter() {
            let _ = tx.send(Signal::Cancel);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wake `tx` on cancellation until the returned guard is dropped.
    pub(crate) fn register(&self, tx: Sender<Signal>) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.wakers().push((id, tx));
        Registration {
            token: self.clone(),
            id,
        }
    }

    fn wakers(&self) -> MutexGuard<'_, Vec<(u64, Sender<Signal>)>> {
        self.inner
            .wakers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct Registration {
    token: CancelToken,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.token.wakers().retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_cancel_wakes_registered_channel() {
        let token = CancelToken::new();
        let (tx, rx) = channel();
        let _reg = token.register(tx);

        token.clone().cancel();

        assert!(token.is_cancelled());
        assert!(matches!(rx.try_recv(), Ok(Signal::Cancel)));
    }

    #[test]
    fn test_registration_removed_on_drop() {
        let token = CancelToken::new();
        let (tx, rx) = channel();
        drop(token.register(tx));

        token.cancel();

        // The only sender was dropped with the registration
        assert!(rx.try_recv().is_err());
        assert!(token.wakers().is_empty());
    }
}
