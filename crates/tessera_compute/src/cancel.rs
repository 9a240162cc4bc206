//! # Cancellation
//!
//! Cooperative at the coordinator only: firing a signal settles the current
//! run as cancelled, but a kernel already running on a worker is never
//! interrupted. Its late reply is discarded as stale.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Creates a connected handle/signal pair.
#[must_use]
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = bounded(1);
    let fired = Arc::new(AtomicBool::new(false));
    (
        CancelHandle {
            tx: tx.clone(),
            fired: Arc::clone(&fired),
        },
        CancelSignal {
            rx,
            fired,
            _keepalive: tx,
        },
    )
}

/// Fires a [`CancelSignal`]. Cloneable; any clone may fire.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Sender<()>,
    fired: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Fires the signal. Idempotent.
    pub fn cancel(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            // Full means a wake-up is already queued.
            let _ = self.tx.try_send(());
        }
    }

    /// Checks whether the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Receiving side, passed to a run through `RunOptions`.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: Receiver<()>,
    fired: Arc<AtomicBool>,
    // Keeps the channel connected after every handle is dropped.
    _keepalive: Sender<()>,
}

impl CancelSignal {
    /// Checks whether the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Wake-up channel for `select!`.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_fires_once() {
        let (handle, signal) = cancel_pair();
        assert!(!signal.is_cancelled());
        handle.cancel();
        handle.clone().cancel();
        assert!(signal.is_cancelled());
        assert!(signal.receiver().try_recv().is_ok());
        assert!(signal.receiver().try_recv().is_err());
    }

    #[test]
    fn test_dropped_handle_does_not_wake() {
        let (handle, signal) = cancel_pair();
        drop(handle);
        assert!(signal
            .receiver()
            .recv_timeout(Duration::from_millis(5))
            .is_err());
        assert!(!signal.is_cancelled());
    }
}
