use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, thiserror::Error)]
#[error("batch ingestion was cancelled")]
pub struct Cancelled;

/// Shared flag telling a running batch to stop starting new work.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raises the signal when the returned guard is dropped while still armed.
    pub fn cancel_on_drop(&self) -> CancelOnDrop {
        CancelOnDrop {
            signal: Some(self.clone()),
        }
    }
}

pub struct CancelOnDrop {
    signal: Option<CancelSignal>,
}

impl CancelOnDrop {
    pub fn disarm(mut self) {
        self.signal = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(signal) = self.signal.take() {
            signal.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_guard_cancels() {
        let signal = CancelSignal::new();
        drop(signal.cancel_on_drop());
        assert!(signal.is_cancelled());
    }

    #[test]
    fn disarmed_guard_leaves_signal_alone() {
        let signal = CancelSignal::new();
        signal.cancel_on_drop().disarm();
        assert!(!signal.is_cancelled());
    }
}
