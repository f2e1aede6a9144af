//! Transfer control signals
//!
//! Pause and cancel are independent watch channels. A worker calls
//! `checkpoint()` between chunks: it parks while paused and errors out once
//! cancelled, so already written bytes stay put and resume picks up at the
//! held offset.

use tokio::sync::watch;

use super::error::TransferError;

#[derive(Debug)]
pub struct TransferControl {
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    pause_tx: watch::Sender<bool>,
    pause_rx: watch::Receiver<bool>,
}

impl TransferControl {
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (pause_tx, pause_rx) = watch::channel(false);
        Self {
            cancel_tx,
            cancel_rx,
            pause_tx,
            pause_rx,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_rx.borrow()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    /// Resolves once the transfer is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Park while paused. Returns `Ok(true)` if it had to wait.
    pub async fn checkpoint(&self) -> Result<bool, TransferError> {
        if self.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if !self.is_paused() {
            return Ok(false);
        }

        let mut pause_rx = self.pause_rx.clone();
        tokio::select! {
            _ = pause_rx.wait_for(|paused| !*paused) => {}
            _ = self.cancelled() => {}
        }

        if self.is_cancelled() {
            Err(TransferError::Cancelled)
        } else {
            Ok(true)
        }
    }
}

impl Default for TransferControl {
    fn default() -> Self {
        Self::new()
    }
}
