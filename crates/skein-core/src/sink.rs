//! Seams between the capture side, the delivery side and observers.

use crate::events::{Envelope, Event, Origin, StateSnapshot};
use crate::ids::ThreadId;

/// What happened to an emitted event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitOutcome {
    Queued { sequence: u64 },
    /// Queued after evicting `evicted` older events.
    Degraded { sequence: u64, evicted: usize },
    /// Non-critical event dropped for lack of room.
    Dropped { sequence: u64 },
    /// Critical event that could not be enqueued in time.
    Undelivered { sequence: u64 },
}

impl EmitOutcome {
    pub fn sequence(&self) -> u64 {
        match *self {
            Self::Queued { sequence }
            | Self::Degraded { sequence, .. }
            | Self::Dropped { sequence }
            | Self::Undelivered { sequence } => sequence,
        }
    }

    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Dropped { .. } | Self::Undelivered { .. })
    }
}

/// Accepts events from the capture bridge, stamps and enqueues them.
pub trait EventSink: Send + Sync {
    fn emit(&self, origin: &Origin, event: Event) -> EmitOutcome;
}

/// Supplies the current full state of a thread for resync.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self, thread_id: &ThreadId) -> Option<StateSnapshot>;

    /// The thread's channel is gone; state may be dropped.
    fn release(&self, _thread_id: &ThreadId) {}
}

/// Sees every stamped envelope exactly once, in sequence order per thread.
pub trait EventObserver: Send + Sync {
    fn observe(&self, envelope: &Envelope);

    /// The thread's channel is gone.
    fn release(&self, _thread_id: &ThreadId) {}
}
