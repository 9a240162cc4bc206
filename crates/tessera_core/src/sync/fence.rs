//! # Memory Fence Protocol
//!
//! Plain writes into a shared buffer carry no visibility guarantee across
//! threads. A worker calls [`MemoryFence::publish`] after its last write; the
//! coordinator calls [`MemoryFence::observe`] before reading the rows as
//! final.
//!
//! ```text
//! worker:       write rows ... publish()  (Release)
//!                                  │
//!                                  ▼ synchronizes-with
//! coordinator:  observe() (Acquire) ... read rows
//! ```

use std::sync::atomic::{fence, AtomicU64, Ordering};

/// Release/acquire epoch counter guarding one shared buffer.
#[derive(Debug, Default)]
pub struct MemoryFence {
    epoch: AtomicU64,
}

impl MemoryFence {
    /// Creates a fence at epoch 0.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
        }
    }

    /// Worker side. Makes every prior write visible to a later `observe`.
    ///
    /// Returns the new epoch.
    #[inline]
    pub fn publish(&self) -> u64 {
        fence(Ordering::Release);
        self.epoch.fetch_add(1, Ordering::Release) + 1
    }

    /// Coordinator side. Pairs with every `publish` that came before.
    ///
    /// Returns the observed epoch.
    #[inline]
    pub fn observe(&self) -> u64 {
        let epoch = self.epoch.load(Ordering::Acquire);
        fence(Ordering::Acquire);
        epoch
    }
}
