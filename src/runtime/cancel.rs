//! One-way cancellation signal.
//!
//! Thin wrapper over `tokio_util`'s token so every suspension point in the
//! core observes the same structured-cancellation contract: parents cancel
//! children, a fired signal never un-fires.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutionError, Result};

#[derive(Debug, Clone, Default)]
pub struct Cancel {
    token: CancellationToken,
}

impl Cancel {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Child signal: fires when this one fires, may fire independently.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn fire(&self) {
        self.token.cancel();
    }

    pub fn fired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Error if the signal has fired; call at every safe point.
    pub fn check(&self) -> Result<()> {
        if self.fired() {
            Err(ExecutionError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Cancellable sleep. Returns `Canceled` if the signal fires first.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(ExecutionError::Canceled),
        }
    }

    /// Run a future under this signal, surfacing `Canceled` if it fires
    /// before the future resolves.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            result = fut => result,
            _ = self.cancelled() => Err(ExecutionError::Canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_once_and_propagates_to_children() {
        let parent = Cancel::new();
        let child = parent.child();
        assert!(!child.fired());
        parent.fire();
        assert!(child.fired());
        assert!(matches!(child.check(), Err(ExecutionError::Canceled)));
    }

    #[test]
    fn check_reports_fired_state() {
        let cancel = Cancel::new();
        tokio_test::block_on(async {
            assert!(cancel.check().is_ok());
            cancel.fire();
            assert!(cancel.check().is_err());
        });
    }

    #[tokio::test]
    async fn sleep_is_interrupted() {
        let cancel = Cancel::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            c.fire();
        });
        let started = std::time::Instant::now();
        let result = cancel.sleep(Duration::from_secs(10)).await;
        assert!(matches!(result, Err(ExecutionError::Canceled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
