//! The per-consumer task that moves envelopes from a channel into a sink.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use skein_core::errors::ErrorKind;
use skein_core::events::{Envelope, Event, Origin};

use crate::channel::{Attachment, DetachReason, ThreadChannel};

/// Envelopes read from the channel per lock acquisition.
pub const DELIVERY_BATCH: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// A terminal event (or a final snapshot of a finished thread) was sent.
    Completed,
    /// Another consumer attached.
    Superseded,
    /// The consumer went away.
    Disconnected,
    Stalled,
    TimedOut,
    Cancelled,
}

impl DeliveryOutcome {
    fn detach_reason(self) -> DetachReason {
        match self {
            Self::Completed => DetachReason::Completed,
            Self::Disconnected => DetachReason::ConsumerGone,
            Self::Stalled => DetachReason::Stalled,
            Self::TimedOut => DetachReason::TimedOut,
            Self::Superseded | Self::Cancelled => DetachReason::Cancelled,
        }
    }
}

enum Forwarded {
    More,
    Finished,
    Gone,
}

struct Cursor {
    generation: u64,
    next: u64,
    last_substantive: Instant,
}

/// Deliver from `attachment.cursor` onwards until the thread finishes, the
/// consumer leaves or is superseded, a timeout fires, or `cancel` does.
///
/// Keepalives go through the channel like any other event. Stall and
/// total-duration timeouts stamp a thread-level `Error` and end the stream
/// after it is sent.
pub async fn run_delivery(
    channel: Arc<ThreadChannel>,
    attachment: Attachment,
    tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) -> DeliveryOutcome {
    let Attachment {
        generation,
        cursor,
        mut signal,
        ..
    } = attachment;
    let config = channel.config().clone();
    let started = Instant::now();
    let deadline = started + config.total_timeout;
    let mut cursor = Cursor {
        generation,
        next: cursor,
        last_substantive: started,
    };
    let mut keepalive = tokio::time::interval_at(started + config.keepalive_interval, config.keepalive_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        if signal.borrow().closed {
            break DeliveryOutcome::Cancelled;
        }
        if !channel.is_current(generation) {
            break DeliveryOutcome::Superseded;
        }
        let batch = channel.read_from(cursor.next, DELIVERY_BATCH);
        if !batch.is_empty() {
            match forward(&channel, batch, &mut cursor, &tx).await {
                Forwarded::More => continue,
                Forwarded::Finished => break DeliveryOutcome::Completed,
                Forwarded::Gone => break DeliveryOutcome::Disconnected,
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break DeliveryOutcome::Cancelled,
            _ = tx.closed() => break DeliveryOutcome::Disconnected,
            changed = signal.changed() => {
                if changed.is_err() {
                    break DeliveryOutcome::Cancelled;
                }
            }
            _ = keepalive.tick() => {
                if cursor.last_substantive.elapsed() >= config.keepalive_interval {
                    channel.push(&Origin::thread(channel.thread_id().clone()), Event::Keepalive);
                }
            }
            _ = tokio::time::sleep_until(cursor.last_substantive + config.inactivity_timeout) => {
                tracing::warn!(
                    thread_id = %channel.thread_id(),
                    generation,
                    idle_secs = config.inactivity_timeout.as_secs(),
                    "no substantive event, ending stream"
                );
                break end_with(&channel, &mut cursor, &tx, ErrorKind::Stalled, DeliveryOutcome::Stalled).await;
            }
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(
                    thread_id = %channel.thread_id(),
                    generation,
                    "stream duration limit reached"
                );
                break end_with(&channel, &mut cursor, &tx, ErrorKind::Timeout, DeliveryOutcome::TimedOut).await;
            }
        }
    };

    channel.detach(generation, outcome.detach_reason());
    tracing::debug!(
        thread_id = %channel.thread_id(),
        generation,
        delivered_through = cursor.next.checked_sub(1),
        outcome = ?outcome,
        "delivery finished"
    );
    outcome
}

async fn forward(
    channel: &ThreadChannel,
    batch: Vec<Envelope>,
    cursor: &mut Cursor,
    tx: &mpsc::Sender<Envelope>,
) -> Forwarded {
    for env in batch {
        let sequence = env.sequence;
        let terminal = env.event.is_terminal();
        let final_snapshot = matches!(&env.event, Event::StateSnapshot(s) if s.is_final());
        let substantive = env.event.is_substantive();
        if tx.send(env).await.is_err() {
            return Forwarded::Gone;
        }
        cursor.next = sequence + 1;
        channel.ack(cursor.generation, sequence);
        if substantive {
            cursor.last_substantive = Instant::now();
        }
        // A finished thread whose terminal event never made it into the
        // buffer ends on its final snapshot instead.
        let ends_here =
            terminal || (final_snapshot && channel.is_terminal() && channel.read_from(cursor.next, 1).is_empty());
        if ends_here {
            return Forwarded::Finished;
        }
    }
    Forwarded::More
}

async fn end_with(
    channel: &ThreadChannel,
    cursor: &mut Cursor,
    tx: &mpsc::Sender<Envelope>,
    kind: ErrorKind,
    outcome: DeliveryOutcome,
) -> DeliveryOutcome {
    let message = match kind {
        ErrorKind::Stalled => "no activity within the inactivity timeout",
        _ => "stream duration limit reached",
    };
    let last = channel.push_control(Event::Error {
        kind,
        message: message.into(),
    });
    while cursor.next <= last {
        let batch = channel.read_from(cursor.next, DELIVERY_BATCH);
        if batch.is_empty() {
            break;
        }
        match forward(channel, batch, cursor, tx).await {
            Forwarded::More => {}
            Forwarded::Finished => return DeliveryOutcome::Completed,
            Forwarded::Gone => return DeliveryOutcome::Disconnected,
        }
    }
    outcome
}
