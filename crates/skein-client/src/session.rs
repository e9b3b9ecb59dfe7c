use skein_core::errors::ErrorKind;
use skein_core::events::{Envelope, Event};
use skein_core::ids::ThreadId;
use skein_core::layout::ObservedGraph;
use skein_core::sequencer::{Offer, SequenceTracker, DEFAULT_REORDER_WINDOW};
use skein_core::usage::{ExecutionMetrics, PricingTable};
use skein_core::wire::Frame;

use crate::reconstruct::{OpenStepPolicy, ReasoningStep, Reconstructor};

/// What happened to one offered frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionUpdate {
    /// This many frames were applied, the offered one included.
    Applied(usize),
    Duplicate,
    /// Held until the gap before it fills.
    Buffered,
    /// Events were lost: a gap on a live connection, or one that outlived
    /// the reorder window. Reconnect without a last sequence.
    ResyncRequired { expected: u64, received: u64 },
}

/// One consumer's view of one thread.
///
/// Frames may arrive duplicated or out of order; the session applies each
/// sequence exactly once and in order. A snapshot, or the disconnect notice
/// the server sends just before one, re-baselines it.
#[derive(Debug)]
pub struct ConsumerSession {
    thread_id: ThreadId,
    tracker: SequenceTracker<Frame>,
    reconstructor: Reconstructor,
    metrics: ExecutionMetrics,
    pricing: PricingTable,
    graph: ObservedGraph,
    finished: bool,
}

impl ConsumerSession {
    pub fn new(thread_id: ThreadId, policy: OpenStepPolicy) -> Self {
        Self {
            metrics: ExecutionMetrics::new(thread_id.clone()),
            thread_id,
            tracker: SequenceTracker::new(DEFAULT_REORDER_WINDOW),
            reconstructor: Reconstructor::new(policy),
            pricing: PricingTable::default(),
            graph: ObservedGraph::new(),
            finished: false,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_reorder_window(mut self, window: usize) -> Self {
        self.tracker = SequenceTracker::new(window);
        self
    }

    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Last sequence applied, to resume from after a reconnect.
    pub fn last_sequence(&self) -> Option<u64> {
        self.tracker.last_applied()
    }

    pub fn steps(&self) -> &[ReasoningStep] {
        self.reconstructor.steps()
    }

    pub fn reconstructor(&self) -> &Reconstructor {
        &self.reconstructor
    }

    pub fn metrics(&self) -> &ExecutionMetrics {
        &self.metrics
    }

    pub fn graph(&self) -> &ObservedGraph {
        &self.graph
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn last_error(&self) -> Option<&(ErrorKind, String)> {
        self.reconstructor.last_error()
    }

    pub fn apply_envelope(&mut self, env: Envelope) -> SessionUpdate {
        self.apply_frame(Frame::Event(env))
    }

    /// Apply a frame from a source that may reorder, holding early frames
    /// until the gap before them fills.
    pub fn apply_frame(&mut self, frame: Frame) -> SessionUpdate {
        self.offer(frame, false)
    }

    /// Apply a frame read off one live connection. A connection delivers in
    /// sequence order, so any gap means lost events and asks for a resync.
    pub fn apply_streamed(&mut self, frame: Frame) -> SessionUpdate {
        self.offer(frame, true)
    }

    fn offer(&mut self, frame: Frame, ordered: bool) -> SessionUpdate {
        let sequence = frame.sequence();
        let offer = if starts_baseline(&frame) {
            self.tracker.rebaseline(sequence, frame)
        } else if ordered {
            self.tracker.offer_ordered(sequence, frame)
        } else {
            self.tracker.offer(sequence, frame)
        };
        match offer {
            Offer::Ready(frames) => {
                let applied = frames.len();
                for frame in frames {
                    self.apply_in_order(frame);
                }
                SessionUpdate::Applied(applied)
            }
            Offer::Duplicate => SessionUpdate::Duplicate,
            Offer::Buffered => {
                tracing::debug!(thread_id = %self.thread_id, sequence, "out-of-order event held");
                SessionUpdate::Buffered
            }
            Offer::ResyncRequired { expected, received } => {
                tracing::warn!(thread_id = %self.thread_id, expected, received, "sequence gap, resync required");
                SessionUpdate::ResyncRequired { expected, received }
            }
        }
    }

    /// Forget sequence state before reconnecting without a last sequence.
    /// Steps and metrics stay; the coming snapshot upserts into them.
    pub fn prepare_resync(&mut self) {
        self.tracker.reset();
    }

    fn apply_in_order(&mut self, frame: Frame) {
        let env = match frame {
            Frame::Event(env) => env,
            Frame::Unknown { kind, sequence, .. } => {
                tracing::debug!(thread_id = %self.thread_id, sequence, kind = %kind, "ignoring unknown event type");
                return;
            }
        };
        let restarted = matches!(env.event, Event::StateSnapshot(_))
            && self.reconstructor.last_sequence().is_some_and(|last| env.sequence < last);
        if restarted {
            tracing::info!(thread_id = %self.thread_id, sequence = env.sequence, "sequence numbering restarted");
            self.reconstructor.reset_sequence();
        }
        self.reconstructor.apply(&env);
        self.metrics.observe(&env, &self.pricing);
        self.graph.observe(&env);
        if env.event.is_terminal() || self.reconstructor.is_finished() {
            self.finished = true;
        }
    }
}

fn starts_baseline(frame: &Frame) -> bool {
    let Frame::Event(env) = frame else {
        return false;
    };
    matches!(
        env.event,
        Event::StateSnapshot(_)
            | Event::Error {
                kind: ErrorKind::Disconnected,
                ..
            }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use skein_capture::ShadowStore;
    use skein_core::events::{Origin, StateSnapshot, StepStatus};
    use skein_core::sink::{EventObserver, SnapshotSource};
    use skein_core::usage::{ExecutionStatus, TokenUsage};

    fn env(seq: u64, event: Event) -> Envelope {
        Envelope::new(&Origin::thread("t".into()), seq, event)
    }

    fn session() -> ConsumerSession {
        ConsumerSession::new("t".into(), OpenStepPolicy::Single)
    }

    fn script() -> Vec<Event> {
        vec![
            Event::GraphStart,
            Event::NodeStart { node: "plan".into() },
            Event::GenerationStart {
                model: "m".into(),
                input_preview: "p".into(),
                call_id: Some("c1".into()),
            },
            Event::GenerationEnd {
                model: "m".into(),
                output_preview: "o".into(),
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                    ..Default::default()
                },
                tool_calls: vec![],
                call_id: Some("c1".into()),
                duration_ms: Some(20),
                time_to_first_token_ms: None,
            },
            Event::ToolStart {
                tool_name: "search".into(),
                args_preview: "q".into(),
            },
            Event::ToolEnd {
                tool_name: "search".into(),
                result_preview: "r".into(),
            },
            Event::NodeEnd { node: "plan".into() },
            Event::NodeStart { node: "answer".into() },
            Event::NodeEnd { node: "answer".into() },
            Event::GraphEnd { response: "done".into() },
        ]
    }

    #[test]
    fn applies_a_clean_stream() {
        let mut s = session();
        for (i, event) in script().into_iter().enumerate() {
            assert_eq!(s.apply_envelope(env(i as u64, event)), SessionUpdate::Applied(1));
        }
        assert!(s.is_finished());
        assert_eq!(s.steps().len(), 4);
        assert_eq!(s.metrics().status, ExecutionStatus::Completed);
        assert_eq!(s.metrics().input_tokens, 10);
        assert_eq!(s.graph().edges.len(), 1);
        assert_eq!(s.last_sequence(), Some(9));
    }

    #[test]
    fn duplicates_are_skipped_and_gaps_reordered() {
        let mut s = session();
        assert_eq!(s.apply_envelope(env(0, Event::GraphStart)), SessionUpdate::Applied(1));
        assert_eq!(
            s.apply_envelope(env(2, Event::NodeEnd { node: "a".into() })),
            SessionUpdate::Buffered
        );
        assert_eq!(
            s.apply_envelope(env(1, Event::NodeStart { node: "a".into() })),
            SessionUpdate::Applied(2)
        );
        assert_eq!(s.apply_envelope(env(1, Event::NodeStart { node: "a".into() })), SessionUpdate::Duplicate);
        assert_eq!(s.steps().len(), 1);
        assert_eq!(s.steps()[0].status, StepStatus::Completed);
    }

    #[test]
    fn persistent_gap_requires_resync() {
        let mut s = session().with_reorder_window(2);
        s.apply_envelope(env(0, Event::GraphStart));
        assert_eq!(s.apply_envelope(env(5, Event::Keepalive)), SessionUpdate::Buffered);
        assert_eq!(s.apply_envelope(env(6, Event::Keepalive)), SessionUpdate::Buffered);
        assert_eq!(
            s.apply_envelope(env(7, Event::Keepalive)),
            SessionUpdate::ResyncRequired { expected: 1, received: 7 }
        );
    }

    #[test]
    fn snapshot_rebaselines_over_a_gap() {
        let mut s = session();
        s.apply_envelope(env(0, Event::GraphStart));
        s.prepare_resync();
        let update = s.apply_envelope(env(
            40,
            Event::StateSnapshot(StateSnapshot {
                next_nodes: vec!["b".into()],
                visited_nodes: vec!["a".into()],
                ..Default::default()
            }),
        ));
        assert_eq!(update, SessionUpdate::Applied(1));
        assert_eq!(s.last_sequence(), Some(40));
        assert_eq!(s.apply_envelope(env(41, Event::Keepalive)), SessionUpdate::Applied(1));
        assert!(!s.is_finished());
    }

    #[test]
    fn unknown_frames_advance_tracking() {
        let mut s = session();
        s.apply_envelope(env(0, Event::GraphStart));
        let unknown = Frame::Unknown {
            kind: "future_event".into(),
            thread_id: "t".into(),
            sequence: 1,
        };
        assert_eq!(s.apply_frame(unknown), SessionUpdate::Applied(1));
        assert_eq!(s.last_sequence(), Some(1));
    }

    fn shadow_snapshot(shadow: &ShadowStore) -> Event {
        let thread: ThreadId = "t".into();
        Event::StateSnapshot(shadow.snapshot(&thread).unwrap_or_default())
    }

    fn step<'a>(s: &'a ConsumerSession, label: &str) -> &'a ReasoningStep {
        s.steps().iter().find(|st| st.label == label).unwrap()
    }

    #[test]
    fn gap_on_a_live_connection_requires_resync() {
        let shadow = ShadowStore::new();
        let events = [
            Event::GraphStart,
            Event::ToolStart {
                tool_name: "search".into(),
                args_preview: "q".into(),
            },
            Event::ToolEnd {
                tool_name: "search".into(),
                result_preview: "r".into(),
            },
        ];
        let envs: Vec<Envelope> = events.into_iter().enumerate().map(|(i, e)| env(i as u64, e)).collect();
        for e in &envs {
            shadow.observe(e);
        }

        let mut s = session();
        assert_eq!(s.apply_streamed(Frame::Event(envs[0].clone())), SessionUpdate::Applied(1));
        assert_eq!(s.apply_streamed(Frame::Event(envs[1].clone())), SessionUpdate::Applied(1));
        let mut late = envs[2].clone();
        late.sequence = 3;
        assert_eq!(
            s.apply_streamed(Frame::Event(late)),
            SessionUpdate::ResyncRequired { expected: 2, received: 3 }
        );
        assert_eq!(step(&s, "search").status, StepStatus::Pending);

        s.prepare_resync();
        assert_eq!(s.apply_streamed(Frame::Event(env(4, shadow_snapshot(&shadow)))), SessionUpdate::Applied(1));
        assert_eq!(step(&s, "search").status, StepStatus::Completed);
        assert_eq!(s.steps().len(), 1);
    }

    #[test]
    fn disconnect_notice_rebaselines_before_the_snapshot() {
        let mut s = session();
        s.apply_streamed(Frame::Event(env(0, Event::GraphStart)));
        s.prepare_resync();
        let notice = Event::Error {
            kind: ErrorKind::Disconnected,
            message: "events were dropped".into(),
        };
        assert_eq!(s.apply_streamed(Frame::Event(env(7, notice))), SessionUpdate::Applied(1));
        let snapshot = Event::StateSnapshot(StateSnapshot {
            next_nodes: vec!["b".into()],
            visited_nodes: vec!["a".into()],
            ..Default::default()
        });
        assert_eq!(s.apply_streamed(Frame::Event(env(9, snapshot))), SessionUpdate::Applied(1));
        assert_eq!(s.last_sequence(), Some(9));
    }

    #[test]
    fn visited_nodes_from_a_shadow_snapshot_complete() {
        let shadow = ShadowStore::new();
        let mut events = Vec::new();
        events.push(Event::GraphStart);
        for node in ["A", "B", "C"] {
            events.push(Event::NodeStart { node: node.into() });
            events.push(Event::NodeEnd { node: node.into() });
        }
        events.push(Event::GraphEnd { response: "done".into() });
        for (i, e) in events.into_iter().enumerate() {
            shadow.observe(&env(i as u64, e));
        }

        let mut s = session();
        assert_eq!(s.apply_envelope(env(8, shadow_snapshot(&shadow))), SessionUpdate::Applied(1));
        let labels: Vec<&str> = s.steps().iter().map(|st| st.label.as_str()).collect();
        assert_eq!(labels, ["A", "B", "C"]);
        assert!(s.steps().iter().all(|st| st.status == StepStatus::Completed));
        assert!(s.is_finished());
    }

    #[test]
    fn visited_nodes_without_history_complete() {
        let mut s = session();
        let snapshot = Event::StateSnapshot(StateSnapshot {
            next_nodes: vec![],
            visited_nodes: vec!["A".into(), "B".into(), "C".into()],
            ..Default::default()
        });
        assert_eq!(s.apply_envelope(env(3, snapshot)), SessionUpdate::Applied(1));
        let labels: Vec<&str> = s.steps().iter().map(|st| st.label.as_str()).collect();
        assert_eq!(labels, ["A", "B", "C"]);
        assert!(s.steps().iter().all(|st| st.status == StepStatus::Completed));
        assert!(s.reconstructor().open_steps().next().is_none());
        assert!(s.is_finished());
    }

    #[test]
    fn stalled_step_completes_after_resume() {
        let shadow = ShadowStore::new();
        let start = [
            env(0, Event::GraphStart),
            env(
                1,
                Event::ToolStart {
                    tool_name: "slow".into(),
                    args_preview: "q".into(),
                },
            ),
        ];
        let mut s = session();
        for e in &start {
            shadow.observe(e);
            s.apply_streamed(Frame::Event(e.clone()));
        }
        let stalled = Event::Error {
            kind: ErrorKind::Stalled,
            message: "no events for a while".into(),
        };
        s.apply_streamed(Frame::Event(env(2, stalled)));
        assert_eq!(step(&s, "slow").status, StepStatus::Errored);
        assert!(!s.is_finished());

        for e in [
            env(
                3,
                Event::ToolEnd {
                    tool_name: "slow".into(),
                    result_preview: "r".into(),
                },
            ),
            env(4, Event::GraphEnd { response: "done".into() }),
        ] {
            shadow.observe(&e);
        }
        s.prepare_resync();
        assert_eq!(s.apply_streamed(Frame::Event(env(5, shadow_snapshot(&shadow)))), SessionUpdate::Applied(1));
        assert_eq!(step(&s, "slow").status, StepStatus::Completed);
        assert!(s.is_finished());
    }

    #[test]
    fn restarted_numbering_is_accepted_from_a_snapshot() {
        let mut s = session();
        for (i, event) in script().into_iter().take(3).enumerate() {
            s.apply_envelope(env(i as u64 + 20, event));
        }
        s.prepare_resync();
        let snapshot = Event::StateSnapshot(StateSnapshot {
            next_nodes: vec!["plan".into()],
            visited_nodes: vec!["plan".into()],
            ..Default::default()
        });
        assert_eq!(s.apply_envelope(env(1, snapshot)), SessionUpdate::Applied(1));
        assert_eq!(s.reconstructor().last_sequence(), Some(1));
        s.apply_envelope(env(2, Event::GraphEnd { response: "done".into() }));
        assert!(s.is_finished());
    }

    proptest! {
        #[test]
        fn duplicates_never_change_the_outcome(dups in proptest::collection::vec((0usize..10, 0usize..10), 0..20)) {
            let envs: Vec<Envelope> = script().into_iter().enumerate().map(|(i, e)| env(i as u64, e)).collect();

            let mut clean = session();
            for e in &envs {
                clean.apply_envelope(e.clone());
            }

            // Each (at, of) re-sends envs[of] right after envs[at] when it was already sent.
            let mut noisy = session();
            for (i, e) in envs.iter().enumerate() {
                noisy.apply_envelope(e.clone());
                for &(at, of) in &dups {
                    if at == i && of <= i {
                        noisy.apply_envelope(envs[of].clone());
                    }
                }
            }

            prop_assert_eq!(clean.steps(), noisy.steps());
            prop_assert_eq!(clean.metrics(), noisy.metrics());
            prop_assert_eq!(clean.last_sequence(), noisy.last_sequence());
        }
    }
}
