use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use skein_core::events::{Envelope, Event, Origin, StateSnapshot};
use skein_core::ids::ThreadId;
use skein_core::sink::{EmitOutcome, EventObserver, EventSink, SnapshotSource};

use crate::channel::{ChannelConfig, ChannelError, ChannelStats, ThreadChannel};
use crate::delivery::{run_delivery, DeliveryOutcome};

/// Envelopes queued between a delivery task and the HTTP body.
const SUBSCRIBER_QUEUE: usize = 256;

/// A live stream for one consumer.
pub struct Subscription {
    pub thread_id: ThreadId,
    pub generation: u64,
    pub resynced: bool,
    pub events: mpsc::Receiver<Envelope>,
    pub task: JoinHandle<DeliveryOutcome>,
}

/// Owns every thread's channel.
///
/// The capture bridge emits into the hub; consumers subscribe through it.
/// Observers see every stamped envelope of every thread.
pub struct ChannelHub {
    channels: DashMap<ThreadId, Arc<ThreadChannel>>,
    config: ChannelConfig,
    observers: Arc<[Arc<dyn EventObserver>]>,
    source: Option<Arc<dyn SnapshotSource>>,
    cancel: CancellationToken,
}

impl ChannelHub {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            channels: DashMap::new(),
            config,
            observers: Arc::from(Vec::new()),
            source: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Register an observer. Only affects channels created afterwards.
    pub fn with_observer(mut self, observer: Arc<dyn EventObserver>) -> Self {
        let mut observers = self.observers.to_vec();
        observers.push(observer);
        self.observers = Arc::from(observers);
        self
    }

    pub fn with_snapshot_source(mut self, source: Arc<dyn SnapshotSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The thread's channel, created on first use.
    pub fn channel(&self, thread_id: &ThreadId) -> Arc<ThreadChannel> {
        if let Some(existing) = self.channels.get(thread_id) {
            return existing.clone();
        }
        self.channels
            .entry(thread_id.clone())
            .or_insert_with(|| {
                tracing::debug!(thread_id = %thread_id, "channel created");
                Arc::new(ThreadChannel::new(
                    thread_id.clone(),
                    self.config.clone(),
                    self.observers.clone(),
                    self.source.clone(),
                ))
            })
            .clone()
    }

    pub fn get(&self, thread_id: &ThreadId) -> Option<Arc<ThreadChannel>> {
        self.channels.get(thread_id).map(|c| c.clone())
    }

    /// Attach a consumer and spawn its delivery task.
    pub fn subscribe(&self, thread_id: &ThreadId, last_sequence: Option<u64>) -> Result<Subscription, ChannelError> {
        if self.cancel.is_cancelled() {
            return Err(ChannelError::Closed(thread_id.clone()));
        }
        let channel = self.channel(thread_id);
        let attachment = channel.attach(last_sequence)?;
        let generation = attachment.generation;
        let resynced = attachment.resynced;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let task = tokio::spawn(run_delivery(channel, attachment, tx, self.cancel.child_token()));
        Ok(Subscription {
            thread_id: thread_id.clone(),
            generation,
            resynced,
            events: rx,
            task,
        })
    }

    /// Current full state of a thread, for follow-up snapshot pulls.
    pub fn snapshot(&self, thread_id: &ThreadId) -> Option<StateSnapshot> {
        self.source.as_ref()?.snapshot(thread_id)
    }

    pub fn stats(&self, thread_id: &ThreadId) -> Option<ChannelStats> {
        self.get(thread_id).map(|c| c.stats())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Remove channels that are detached and finished (or never used) and
    /// idle past the retention period. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let retention = self.config.retention;
        let expired: Vec<ThreadId> = self
            .channels
            .iter()
            .filter(|entry| entry.value().is_expired(retention))
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for thread_id in expired {
            if self
                .channels
                .remove_if(&thread_id, |_, c| c.is_expired(retention))
                .is_some()
            {
                if let Some(source) = &self.source {
                    source.release(&thread_id);
                }
                for observer in self.observers.iter() {
                    observer.release(&thread_id);
                }
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, remaining = self.channels.len(), "expired channels cleaned up");
        }
        removed
    }

    /// Run [`cleanup`](Self::cleanup) every `cleanup_interval` until shutdown.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hub.config.cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = hub.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.cleanup();
                    }
                }
            }
        })
    }

    /// Stop every delivery task and refuse new consumers. Executions keep
    /// emitting into their buffers.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        for entry in self.channels.iter() {
            entry.value().close();
        }
        tracing::info!(threads = self.channels.len(), "channel hub shut down");
    }
}

impl EventSink for ChannelHub {
    fn emit(&self, origin: &Origin, event: Event) -> EmitOutcome {
        self.channel(&origin.thread_id).push(origin, event)
    }
}
