//! Caller-side cancellation.
//!
//! A [`Cancel`] only ends the caller's wait; shared fetches keep running for
//! the remaining waiters.

use std::future;
use std::time::Duration;

use tokio::sync::watch;

/// Cancellation signal handed to manager operations.
#[derive(Debug, Clone)]
pub struct Cancel {
    rx: watch::Receiver<bool>,
}

/// Fires the paired [`Cancel`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl Cancel {
    /// Create a signal and the handle that fires it.
    pub fn pair() -> (CancelHandle, Cancel) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancel { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// A signal that fires once `timeout` elapses.
    ///
    /// Must be called from within a tokio runtime.
    pub fn after(timeout: Duration) -> Self {
        let (handle, cancel) = Self::pair();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            handle.cancel();
        });
        cancel
    }

    /// Wrap an existing shutdown-style watch receiver (`true` means cancelled).
    pub fn from_watch(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires; pending forever if it never can.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            future::pending::<()>().await;
        }
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_handle_fires_signal() {
        let (handle, cancel) = Cancel::pair();
        assert!(!cancel.is_cancelled());

        handle.cancel();
        assert!(cancel.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), cancel.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_stays_pending() {
        let cancel = Cancel::never();
        let waited = tokio::time::timeout(Duration::from_secs(60), cancel.cancelled()).await;
        assert!(waited.is_err());
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_on_timeout() {
        let cancel = Cancel::after(Duration::from_millis(10));
        cancel.cancelled().await;
        assert!(cancel.is_cancelled());
    }
}
