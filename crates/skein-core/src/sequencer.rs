use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-thread sequence counter. Starts at 0 and never repeats.
#[derive(Debug, Default)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// The sequence the next call to [`Sequencer::next`] will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }
}

/// Default number of out-of-order items held while waiting for a gap to fill.
pub const DEFAULT_REORDER_WINDOW: usize = 64;

/// Result of offering one sequenced item to a [`SequenceTracker`].
#[derive(Debug, PartialEq)]
pub enum Offer<T> {
    /// Items now applicable, in sequence order.
    Ready(Vec<T>),
    /// Already applied or already held.
    Duplicate,
    /// Held until the gap before it fills.
    Buffered,
    /// The gap outlived the reorder window. Buffered items were discarded.
    ResyncRequired { expected: u64, received: u64 },
}

/// Consumer-side ordering: dedup, bounded reorder, gap detection.
#[derive(Debug)]
pub struct SequenceTracker<T> {
    applied: Option<u64>,
    pending: BTreeMap<u64, T>,
    window: usize,
}

impl<T> Default for SequenceTracker<T> {
    fn default() -> Self {
        Self::new(DEFAULT_REORDER_WINDOW)
    }
}

impl<T> SequenceTracker<T> {
    pub fn new(window: usize) -> Self {
        Self {
            applied: None,
            pending: BTreeMap::new(),
            window: window.max(1),
        }
    }

    /// Highest sequence applied so far.
    pub fn last_applied(&self) -> Option<u64> {
        self.applied
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn offer(&mut self, sequence: u64, item: T) -> Offer<T> {
        let expected = match self.applied {
            // A cold tracker takes whatever arrives first as its baseline.
            None => sequence,
            Some(last) if sequence <= last => return Offer::Duplicate,
            Some(last) => last.saturating_add(1),
        };

        if sequence == expected {
            self.applied = Some(sequence);
            let mut ready = vec![item];
            self.drain_contiguous(&mut ready);
            return Offer::Ready(ready);
        }

        if self.pending.contains_key(&sequence) {
            return Offer::Duplicate;
        }
        self.pending.insert(sequence, item);
        if self.pending.len() > self.window {
            self.pending.clear();
            return Offer::ResyncRequired {
                expected,
                received: sequence,
            };
        }
        Offer::Buffered
    }

    /// Offer from a source that never reorders, such as one connection.
    /// A gap there means the missing items were lost, so it is reported at
    /// once instead of waiting for the reorder window.
    pub fn offer_ordered(&mut self, sequence: u64, item: T) -> Offer<T> {
        if let Some(last) = self.applied {
            let expected = last.saturating_add(1);
            if sequence > expected {
                self.pending.clear();
                return Offer::ResyncRequired {
                    expected,
                    received: sequence,
                };
            }
        }
        self.offer(sequence, item)
    }

    /// Accept a full-state item at `sequence`, skipping any gap before it.
    pub fn rebaseline(&mut self, sequence: u64, item: T) -> Offer<T> {
        if self.applied.is_some_and(|last| sequence <= last) {
            return Offer::Duplicate;
        }
        self.pending = match sequence.checked_add(1) {
            Some(after) => self.pending.split_off(&after),
            None => BTreeMap::new(),
        };
        self.applied = Some(sequence);
        let mut ready = vec![item];
        self.drain_contiguous(&mut ready);
        Offer::Ready(ready)
    }

    /// Forget everything; the next offer becomes the new baseline.
    pub fn reset(&mut self) {
        self.applied = None;
        self.pending.clear();
    }

    fn drain_contiguous(&mut self, ready: &mut Vec<T>) {
        while let Some(next_seq) = self.applied.and_then(|last| last.checked_add(1)) {
            match self.pending.remove(&next_seq) {
                Some(next) => {
                    self.applied = Some(next_seq);
                    ready.push(next);
                }
                None => break,
            }
        }
    }
}
