//! # Write Masks
//!
//! Per-column record of which rows were written since the last drain.
//!
//! Workers mark rows through `&self` from any thread; the coordinator drains
//! after a run settles. One bit per row, 64 rows per word.
//!
//! ## Performance
//!
//! - Mark: O(1), one `fetch_or`
//! - Drain: O(capacity/64 + marked)

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Atomic row bitset.
#[derive(Debug)]
pub struct WriteMask {
    /// 1 = written since last drain.
    words: Box<[AtomicU64]>,
    /// Capacity in rows.
    capacity: usize,
    /// Number of set bits.
    pending: AtomicUsize,
}

impl WriteMask {
    /// Creates a cleared mask covering `capacity` rows.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of rows to track
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let word_count = capacity.div_ceil(64);
        Self {
            words: (0..word_count).map(|_| AtomicU64::new(0)).collect(),
            capacity,
            pending: AtomicUsize::new(0),
        }
    }

    /// Rows this mask can track.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Marks `row` as written. Returns `false` if `row` is out of range.
    #[inline]
    pub fn mark(&self, row: usize) -> bool {
        if row >= self.capacity {
            return false;
        }
        let bit = 1u64 << (row % 64);
        let prev = self.words[row / 64].fetch_or(bit, Ordering::Relaxed);
        if prev & bit == 0 {
            self.pending.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Marks every row in `[start, end)`.
    pub fn mark_range(&self, start: usize, end: usize) {
        for row in start..end.min(self.capacity) {
            self.mark(row);
        }
    }

    /// Checks whether `row` is marked.
    #[inline]
    #[must_use]
    pub fn is_marked(&self, row: usize) -> bool {
        if row >= self.capacity {
            return false;
        }
        (self.words[row / 64].load(Ordering::Relaxed) >> (row % 64)) & 1 == 1
    }

    /// Clears one row. Returns whether it was marked.
    pub fn unmark(&self, row: usize) -> bool {
        if row >= self.capacity {
            return false;
        }
        let bit = 1u64 << (row % 64);
        let prev = self.words[row / 64].fetch_and(!bit, Ordering::Relaxed);
        let was = prev & bit != 0;
        if was {
            self.pending.fetch_sub(1, Ordering::Relaxed);
        }
        was
    }

    /// Moves the mark of `from` onto `to` and clears `from`.
    ///
    /// Keeps marks aligned when a row is swap-removed.
    pub fn move_row(&self, from: usize, to: usize) {
        if from == to {
            return;
        }
        let marked = self.unmark(from);
        self.unmark(to);
        if marked {
            self.mark(to);
        }
    }

    /// Number of marked rows.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    /// Returns every marked row in ascending order and clears the mask.
    #[must_use]
    pub fn drain(&self) -> Vec<usize> {
        let mut rows = Vec::with_capacity(self.pending());
        for (word_idx, word) in self.words.iter().enumerate() {
            let mut bits = word.swap(0, Ordering::AcqRel);
            if bits == 0 {
                continue;
            }
            self.pending
                .fetch_sub(bits.count_ones() as usize, Ordering::Relaxed);
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                rows.push(word_idx * 64 + bit);
            }
        }
        rows
    }

    /// Copies the current marks into a larger mask.
    #[must_use]
    pub fn grown(&self, capacity: usize) -> Self {
        let next = Self::with_capacity(capacity.max(self.capacity));
        for (dst, src) in next.words.iter().zip(self.words.iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        next.pending.store(self.pending(), Ordering::Relaxed);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_mark_and_drain_ascending() {
        let mask = WriteMask::with_capacity(200);
        for row in [130, 3, 64, 3, 199] {
            mask.mark(row);
        }
        assert_eq!(mask.pending(), 4);
        assert_eq!(mask.drain(), vec![3, 64, 130, 199]);
        assert_eq!(mask.pending(), 0);
        assert!(mask.drain().is_empty());
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mask = WriteMask::with_capacity(10);
        assert!(!mask.mark(10));
        assert!(!mask.is_marked(10));
        assert_eq!(mask.pending(), 0);
    }

    #[test]
    fn test_move_row_tracks_swap_remove() {
        let mask = WriteMask::with_capacity(8);
        mask.mark(7);
        mask.mark(2);
        // Row 7 moved into slot 2.
        mask.move_row(7, 2);
        assert!(mask.is_marked(2));
        assert!(!mask.is_marked(7));

        // Unmarked source clears the destination.
        mask.move_row(5, 2);
        assert!(!mask.is_marked(2));
        assert_eq!(mask.pending(), 0);
    }

    #[test]
    fn test_grown_keeps_marks() {
        let mask = WriteMask::with_capacity(4);
        mask.mark(1);
        let bigger = mask.grown(300);
        assert_eq!(bigger.capacity(), 300);
        assert!(bigger.is_marked(1));
        assert!(bigger.mark(299));
        assert_eq!(bigger.drain(), vec![1, 299]);
    }

    #[test]
    fn test_concurrent_marks() {
        let mask = Arc::new(WriteMask::with_capacity(4096));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let mask = Arc::clone(&mask);
                std::thread::spawn(move || {
                    for row in (t * 1024)..((t + 1) * 1024) {
                        mask.mark(row);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(mask.pending(), 4096);
        assert_eq!(mask.drain().len(), 4096);
    }
}
