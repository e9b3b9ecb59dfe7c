//! Per-thread bounded event log with a single attached consumer.
//!
//! The channel owns the thread's [`Sequencer`]. Sequence numbers are drawn
//! while the state lock is held, so buffer order always equals sequence order
//! no matter how many sub-tasks emit concurrently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;

use skein_core::errors::ErrorKind;
use skein_core::events::{Envelope, Event, Origin};
use skein_core::ids::ThreadId;
use skein_core::sequencer::Sequencer;
use skein_core::sink::{EmitOutcome, EventObserver, SnapshotSource};

/// What a channel does with non-critical events while no consumer is attached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPolicy {
    /// Keep buffering under the usual eviction order.
    #[default]
    Buffer,
    /// Drop non-critical events; the next consumer resyncs from a snapshot.
    Discard,
}

impl std::str::FromStr for DrainPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buffer" => Ok(Self::Buffer),
            "discard" => Ok(Self::Discard),
            other => Err(format!("unknown drain policy: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Maximum buffered envelopes per thread.
    pub capacity: usize,
    pub keepalive_interval: Duration,
    pub inactivity_timeout: Duration,
    pub total_timeout: Duration,
    /// Longest a critical event waits for room before the thread is marked
    /// undelivered.
    pub critical_enqueue_timeout: Duration,
    pub drain_policy: DrainPolicy,
    /// How long a detached channel is kept after its last activity.
    pub retention: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            keepalive_interval: Duration::from_secs(15),
            inactivity_timeout: Duration::from_secs(120),
            total_timeout: Duration::from_secs(3600),
            critical_enqueue_timeout: Duration::from_secs(2),
            drain_policy: DrainPolicy::Buffer,
            retention: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel for thread {0} is closed")]
    Closed(ThreadId),
}

/// Broadcast to delivery tasks whenever the log grows or the consumer changes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ChannelSignal {
    /// Next sequence to be stamped.
    pub head: u64,
    pub generation: u64,
    pub closed: bool,
}

/// Why a delivery task let go of the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetachReason {
    Completed,
    ConsumerGone,
    Stalled,
    TimedOut,
    Cancelled,
}

/// A consumer's claim on the channel.
#[derive(Debug)]
pub struct Attachment {
    pub generation: u64,
    /// First sequence this consumer is sent.
    pub cursor: u64,
    /// Whether the attachment starts from a fresh snapshot rather than a replay.
    pub resynced: bool,
    pub signal: watch::Receiver<ChannelSignal>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChannelStats {
    pub thread_id: ThreadId,
    pub head: u64,
    pub buffered: usize,
    pub delivered_through: Option<u64>,
    pub attached: bool,
    pub generation: u64,
    pub terminal: bool,
    pub undelivered: bool,
    pub dropped: u64,
}

struct ChannelState {
    buffer: VecDeque<Envelope>,
    delivered_through: Option<u64>,
    attached: bool,
    generation: u64,
    terminal: bool,
    disconnected_pending: bool,
    /// The last delivery ended on a stall or timeout mid-run.
    resync_pending: bool,
    undelivered: bool,
    /// Sequence of the latest `Error{undelivered}` notice.
    undelivered_notice: Option<u64>,
    closed: bool,
    dropped: u64,
    last_activity: Instant,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            delivered_through: None,
            attached: false,
            generation: 0,
            terminal: false,
            disconnected_pending: false,
            resync_pending: false,
            undelivered: false,
            undelivered_notice: None,
            closed: false,
            dropped: 0,
            last_activity: Instant::now(),
        }
    }

    /// Free one slot: a delivered event, else the oldest droppable one, else
    /// the oldest non-critical one.
    fn evict_one(&mut self) -> bool {
        let delivered = match (self.buffer.front(), self.delivered_through) {
            (Some(front), Some(through)) => front.sequence <= through,
            _ => false,
        };
        if delivered {
            self.buffer.pop_front();
            return true;
        }
        let victim = self
            .buffer
            .iter()
            .position(|e| e.event.is_droppable())
            .or_else(|| self.buffer.iter().position(|e| !e.event.is_critical()));
        match victim {
            Some(idx) => {
                self.buffer.remove(idx);
                true
            }
            None => false,
        }
    }

    /// `next` and everything after it up to `head` are still buffered.
    fn can_replay_from(&self, next: u64, head: u64) -> bool {
        if next == head {
            return true;
        }
        if next > head {
            return false;
        }
        let start = self.buffer.partition_point(|e| e.sequence < next);
        match self.buffer.get(start) {
            Some(env) if env.sequence == next => (self.buffer.len() - start) as u64 == head - next,
            _ => false,
        }
    }
}

pub struct ThreadChannel {
    thread_id: ThreadId,
    config: ChannelConfig,
    sequencer: Sequencer,
    state: Mutex<ChannelState>,
    space: Condvar,
    signal: watch::Sender<ChannelSignal>,
    observers: Arc<[Arc<dyn EventObserver>]>,
    source: Option<Arc<dyn SnapshotSource>>,
}

impl ThreadChannel {
    pub fn new(
        thread_id: ThreadId,
        config: ChannelConfig,
        observers: Arc<[Arc<dyn EventObserver>]>,
        source: Option<Arc<dyn SnapshotSource>>,
    ) -> Self {
        let (signal, _) = watch::channel(ChannelSignal::default());
        Self {
            thread_id,
            config,
            sequencer: Sequencer::new(),
            state: Mutex::new(ChannelState::new()),
            space: Condvar::new(),
            signal,
            observers,
            source,
        }
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Next sequence to be stamped.
    pub fn head(&self) -> u64 {
        self.sequencer.peek()
    }

    /// Stamp and enqueue one event from the engine side.
    ///
    /// Never fails. A full buffer evicts delivered events first, then
    /// keepalives and chunks, then other non-critical events. A critical event
    /// that finds nothing to evict waits up to `critical_enqueue_timeout` for
    /// the consumer to acknowledge.
    pub fn push(&self, origin: &Origin, event: Event) -> EmitOutcome {
        let critical = event.is_critical();
        let mut state = self.state.lock();

        if !critical && !state.attached && self.config.drain_policy == DrainPolicy::Discard {
            let env = self.stamp(&mut state, origin, event);
            state.dropped += 1;
            return EmitOutcome::Dropped { sequence: env.sequence };
        }

        let mut evicted = 0;
        if state.buffer.len() >= self.config.capacity {
            if state.evict_one() {
                evicted = 1;
            } else if !critical {
                let env = self.stamp(&mut state, origin, event);
                state.dropped += 1;
                tracing::warn!(
                    thread_id = %self.thread_id,
                    sequence = env.sequence,
                    kind = env.event.kind(),
                    "queue full, event dropped"
                );
                return EmitOutcome::Dropped { sequence: env.sequence };
            } else {
                let deadline = std::time::Instant::now() + self.config.critical_enqueue_timeout;
                loop {
                    let timed_out = self.space.wait_until(&mut state, deadline).timed_out();
                    if state.buffer.len() < self.config.capacity || state.evict_one() {
                        evicted = 1;
                        break;
                    }
                    if timed_out {
                        let env = self.stamp(&mut state, origin, event);
                        state.undelivered = true;
                        tracing::warn!(
                            thread_id = %self.thread_id,
                            sequence = env.sequence,
                            kind = env.event.kind(),
                            "critical event undelivered, thread needs a snapshot pull"
                        );
                        let head = self.notify_undelivered(&mut state).unwrap_or(env.sequence) + 1;
                        drop(state);
                        self.publish_head(head);
                        return EmitOutcome::Undelivered { sequence: env.sequence };
                    }
                }
            }
        }

        let env = self.stamp(&mut state, origin, event);
        let sequence = env.sequence;
        state.buffer.push_back(env);
        drop(state);
        self.publish_head(sequence + 1);

        if evicted > 0 {
            tracing::debug!(thread_id = %self.thread_id, sequence, evicted, "queue full, evicted older events");
            EmitOutcome::Degraded { sequence, evicted }
        } else {
            EmitOutcome::Queued { sequence }
        }
    }

    /// Enqueue a channel-originated event without waiting.
    ///
    /// When nothing is evictable the buffer grows past capacity. That happens
    /// for at most two events per attach (the disconnect notice and the
    /// resync snapshot) plus one outstanding undelivered notice.
    pub fn push_control(&self, event: Event) -> u64 {
        let mut state = self.state.lock();
        let sequence = self.push_locked(&mut state, event);
        drop(state);
        self.publish_head(sequence + 1);
        sequence
    }

    fn push_locked(&self, state: &mut ChannelState, event: Event) -> u64 {
        if state.buffer.len() >= self.config.capacity {
            state.evict_one();
        }
        let env = self.stamp(state, &Origin::thread(self.thread_id.clone()), event);
        let sequence = env.sequence;
        state.buffer.push_back(env);
        sequence
    }

    /// Tell the consumer a critical event was lost, unless an earlier notice
    /// is still waiting to be delivered. The gap before the notice makes the
    /// consumer resync.
    fn notify_undelivered(&self, state: &mut ChannelState) -> Option<u64> {
        let outstanding = state
            .undelivered_notice
            .is_some_and(|notice| state.delivered_through.map_or(true, |through| through < notice));
        if outstanding {
            return None;
        }
        let sequence = self.push_locked(
            state,
            Event::Error {
                kind: ErrorKind::Undelivered,
                message: "a critical event could not be enqueued; pull a snapshot".into(),
            },
        );
        state.undelivered_notice = Some(sequence);
        Some(sequence)
    }

    fn stamp(&self, state: &mut ChannelState, origin: &Origin, event: Event) -> Envelope {
        let env = Envelope::new(origin, self.sequencer.next(), event);
        if env.event.is_terminal() {
            state.terminal = true;
        }
        state.last_activity = Instant::now();
        for observer in self.observers.iter() {
            observer.observe(&env);
        }
        env
    }

    fn publish_head(&self, head: u64) {
        self.signal.send_modify(|s| s.head = s.head.max(head));
    }

    /// Attach a new consumer, superseding any current one.
    ///
    /// With `last_sequence` whose successors are all still buffered the
    /// consumer resumes from `last_sequence + 1`. Otherwise a fresh
    /// `StateSnapshot` is stamped and delivery starts there. A thread whose
    /// previous consumer vanished mid-run always resyncs, preceded by an
    /// `Error{disconnected}`. So does one whose previous delivery ended on a
    /// stall or timeout, since that consumer error-closed its open steps.
    pub fn attach(&self, last_sequence: Option<u64>) -> Result<Attachment, ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Closed(self.thread_id.clone()));
        }
        state.generation += 1;
        let generation = state.generation;
        state.attached = true;
        state.last_activity = Instant::now();

        let disconnected = std::mem::take(&mut state.disconnected_pending);
        let forced = std::mem::take(&mut state.resync_pending) || disconnected;
        let notice = disconnected.then(|| {
            self.push_locked(
                &mut state,
                Event::Error {
                    kind: ErrorKind::Disconnected,
                    message: "previous consumer disconnected before the thread finished".into(),
                },
            )
        });

        let head = self.sequencer.peek();
        let resume_from = last_sequence
            .map(|last| last.saturating_add(1))
            .filter(|next| !forced && state.can_replay_from(*next, head));

        let cursor = match resume_from {
            Some(next) => next,
            None => match self.source.as_ref().and_then(|s| s.snapshot(&self.thread_id)) {
                Some(snapshot) => self.push_locked(&mut state, Event::StateSnapshot(snapshot)),
                None => state.buffer.front().map(|e| e.sequence).unwrap_or(head),
            },
        };
        let cursor = notice.map_or(cursor, |n| n.min(cursor));
        state.delivered_through = cursor.checked_sub(1);
        let head = self.sequencer.peek();
        drop(state);

        self.signal.send_modify(|s| {
            s.generation = generation;
            s.head = s.head.max(head);
        });
        let resynced = resume_from.is_none();
        tracing::info!(
            thread_id = %self.thread_id,
            generation,
            cursor,
            resynced,
            disconnected,
            "consumer attached"
        );
        Ok(Attachment {
            generation,
            cursor,
            resynced,
            signal: self.signal.subscribe(),
        })
    }

    /// Release the channel if `generation` is still the attached consumer.
    pub fn detach(&self, generation: u64, reason: DetachReason) {
        let mut state = self.state.lock();
        if state.generation != generation || !state.attached {
            return;
        }
        state.attached = false;
        state.last_activity = Instant::now();
        match reason {
            DetachReason::ConsumerGone if !state.terminal => {
                state.disconnected_pending = true;
                tracing::warn!(thread_id = %self.thread_id, generation, "consumer disconnected mid-run");
            }
            DetachReason::ConsumerGone => {
                tracing::debug!(thread_id = %self.thread_id, generation, "consumer disconnected after completion");
            }
            DetachReason::Stalled | DetachReason::TimedOut if !state.terminal => {
                state.resync_pending = true;
                tracing::info!(thread_id = %self.thread_id, generation, reason = ?reason, "delivery ended mid-run, next attach resyncs");
            }
            other => {
                tracing::debug!(thread_id = %self.thread_id, generation, reason = ?other, "consumer detached");
            }
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        let state = self.state.lock();
        state.generation == generation && state.attached && !state.closed
    }

    /// Buffered envelopes with `sequence >= cursor`, oldest first.
    pub fn read_from(&self, cursor: u64, max: usize) -> Vec<Envelope> {
        let state = self.state.lock();
        let start = state.buffer.partition_point(|e| e.sequence < cursor);
        state.buffer.range(start..).take(max).cloned().collect()
    }

    /// Record that the consumer of `generation` has everything through
    /// `sequence`, freeing those slots for eviction.
    pub fn ack(&self, generation: u64, sequence: u64) {
        let mut state = self.state.lock();
        if state.generation != generation {
            return;
        }
        if state.delivered_through.map_or(true, |d| sequence > d) {
            state.delivered_through = Some(sequence);
        }
        drop(state);
        self.space.notify_all();
    }

    pub fn is_terminal(&self) -> bool {
        self.state.lock().terminal
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    /// Detached, and either finished or never used, for at least `retention`.
    pub fn is_expired(&self, retention: Duration) -> bool {
        let state = self.state.lock();
        let finished = state.terminal || (state.buffer.is_empty() && self.sequencer.peek() == 0);
        !state.attached && finished && state.last_activity.elapsed() >= retention
    }

    /// Refuse new consumers and wake every delivery task.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.signal.send_modify(|s| s.closed = true);
        self.space.notify_all();
    }

    pub fn stats(&self) -> ChannelStats {
        let state = self.state.lock();
        ChannelStats {
            thread_id: self.thread_id.clone(),
            head: self.sequencer.peek(),
            buffered: state.buffer.len(),
            delivered_through: state.delivered_through,
            attached: state.attached,
            generation: state.generation,
            terminal: state.terminal,
            undelivered: state.undelivered,
            dropped: state.dropped,
        }
    }
}
