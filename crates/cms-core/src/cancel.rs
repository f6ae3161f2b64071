//! Cooperative cancellation signal.

use tokio::sync::watch;

/// Sender side; dropping it does not cancel.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even without receivers.
        self.tx.send_replace(true);
    }
}

/// Receiver side, checked at safe points by long-running operations.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// A linked handle and signal.
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Self { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// `Err(Cancelled)` once the signal fired.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::CmsError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when cancelled; pends forever if the handle is gone uncancelled.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_flag() {
        let (handle, signal) = Cancellation::new();
        let copy = signal.clone();
        assert!(!signal.is_cancelled());
        assert!(signal.check().is_ok());
        handle.cancel();
        assert!(signal.is_cancelled());
        assert!(copy.is_cancelled());
        assert!(matches!(signal.check(), Err(crate::CmsError::Cancelled)));
    }

    #[test]
    fn test_never() {
        assert!(!Cancellation::never().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let (handle, mut signal) = Cancellation::new();
        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
