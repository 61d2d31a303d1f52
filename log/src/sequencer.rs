//! In-process position allocator.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::Position;

/// Monotonic position allocator appointed by a view.
///
/// A sequencer is logically the single writer for its view, but `allocate`
/// is called concurrently from every appender thread, so the counter is a
/// bare atomic. The instance lives as long as some view (or appender) holds
/// a reference to it; view refreshes reuse the same instance whenever the
/// appointment is unchanged, so in-flight allocations survive view changes
/// that keep the same sequencer.
#[derive(Debug)]
pub(crate) struct Sequencer {
    /// Epoch of the view that appointed this sequencer.
    init_epoch: u64,
    next: AtomicU64,
}

impl Sequencer {
    pub(crate) fn new(init_epoch: u64, position: Position) -> Self {
        Self {
            init_epoch,
            next: AtomicU64::new(position),
        }
    }

    /// Epoch of the appointing view.
    pub(crate) fn init_epoch(&self) -> u64 {
        self.init_epoch
    }

    /// Claims and returns the next unused position.
    pub(crate) fn allocate(&self) -> Position {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The next position `allocate` would return, without claiming it.
    pub(crate) fn tail(&self) -> Position {
        self.next.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn should_allocate_monotonically_from_init_position() {
        // given
        let seq = Sequencer::new(3, 160);

        // when/then
        assert_eq!(seq.tail(), 160);
        assert_eq!(seq.allocate(), 160);
        assert_eq!(seq.allocate(), 161);
        assert_eq!(seq.tail(), 162);
        assert_eq!(seq.init_epoch(), 3);
    }

    #[test]
    fn should_never_hand_out_duplicates_under_contention() {
        // given
        let seq = Arc::new(Sequencer::new(1, 0));
        let mut handles = Vec::new();

        // when: 8 threads allocate 1000 positions each
        for _ in 0..8 {
            let seq = Arc::clone(&seq);
            handles.push(std::thread::spawn(move || {
                (0..1000).map(|_| seq.allocate()).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        // then: every allocation is unique and the range is dense
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 8000);
        assert_eq!(seq.tail(), 8000);
    }
}
