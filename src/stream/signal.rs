use std::time::Duration;
use tokio::sync::watch;

use crate::error::{Result, StreamRateError};

/// A one-way closed flag that also interrupts pending waits.
#[derive(Debug)]
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    /// Mark as closed. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    /// Sleep for `wait`, or fail with [`StreamRateError::Closed`] as soon as
    /// the signal is closed.
    pub async fn sleep(&self, wait: Duration) -> Result<()> {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            _ = rx.wait_for(|closed| *closed) => Err(StreamRateError::Closed),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }
}
