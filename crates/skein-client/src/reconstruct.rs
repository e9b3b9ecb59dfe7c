//! Turns an ordered event stream into reasoning steps.
//!
//! Every opening event (`GenerationStart`, `ToolStart`, `NodeStart`) closes
//! the step currently open in its lane before opening its own, so steps never
//! nest. A node step closed this way still takes its `NodeEnd` as end time.
//! Steps are keyed by [`StepKey`], which the producer uses for snapshot task
//! records too; a step seen twice is one step.
//!
//! A transport error (stall, timeout, disconnect, lost critical event)
//! error-closes the open steps but leaves them settleable: the matching close
//! event, a terminal event or a snapshot record still decides their outcome.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use skein_core::errors::ErrorKind;
use skein_core::events::{Envelope, Event, StateSnapshot, StepKind, StepStatus, TaskRecord};
use skein_core::ids::{CallId, NodeId, RunId, StepKey, TaskId};

/// How many steps may be open at once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenStepPolicy {
    /// One open step per thread.
    #[default]
    Single,
    /// One open step per `task_id` (or `run_id`), so concurrent tool calls
    /// stay open side by side.
    PerScope,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReasoningStep {
    pub id: StepKey,
    /// 1-based position in creation order.
    pub ordinal: usize,
    pub kind: StepKind,
    pub label: String,
    pub status: StepStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub token_count: u64,
    pub input_preview: Option<String>,
    pub output_preview: Option<String>,
    pub run_id: Option<RunId>,
    pub task_id: Option<TaskId>,
    #[serde(skip)]
    force_closed: bool,
    /// Error-closed by a transport error; still open to a real outcome.
    #[serde(skip)]
    interrupted: bool,
}

impl ReasoningStep {
    pub fn is_pending(&self) -> bool {
        self.status == StepStatus::Pending
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    fn scope(&self) -> Option<&str> {
        self.task_id
            .as_ref()
            .map(|t| t.as_str())
            .or_else(|| self.run_id.as_ref().map(|r| r.as_str()))
    }

    /// Pending, or interrupted by a transport error.
    fn is_open(&self) -> bool {
        self.is_pending() || self.interrupted
    }

    fn close(&mut self, at: DateTime<Utc>, status: StepStatus) -> bool {
        if !self.is_open() {
            return false;
        }
        self.status = status;
        self.end_time = Some(at);
        self.interrupted = false;
        true
    }

    fn interrupt(&mut self, at: DateTime<Utc>) {
        if self.is_pending() {
            self.status = StepStatus::Errored;
            self.end_time = Some(at);
            self.interrupted = true;
        }
    }

    fn absorb_record(&mut self, record: &TaskRecord) {
        self.kind = record.kind;
        self.label.clone_from(&record.label);
        self.status = record.status;
        self.interrupted = false;
        self.start_time = record.started_at;
        self.end_time = record.ended_at;
        self.token_count = self.token_count.max(record.token_count);
        if record.input_preview.is_some() {
            self.input_preview.clone_from(&record.input_preview);
        }
        if record.output_preview.is_some() {
            self.output_preview.clone_from(&record.output_preview);
        }
        if record.run_id.is_some() {
            self.run_id.clone_from(&record.run_id);
        }
        if record.task_id.is_some() {
            self.task_id.clone_from(&record.task_id);
        }
    }
}

type Lane = Option<String>;

#[derive(Debug, Default)]
pub struct Reconstructor {
    policy: OpenStepPolicy,
    steps: Vec<ReasoningStep>,
    index: HashMap<StepKey, usize>,
    open: HashMap<Lane, StepKey>,
    open_nodes: HashMap<(Lane, NodeId), StepKey>,
    counted_calls: HashSet<CallId>,
    total_tokens: u64,
    unattributed_tokens: u64,
    finished: bool,
    last_error: Option<(ErrorKind, String)>,
    last_sequence: Option<u64>,
}

impl Reconstructor {
    pub fn new(policy: OpenStepPolicy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> OpenStepPolicy {
        self.policy
    }

    pub fn steps(&self) -> &[ReasoningStep] {
        &self.steps
    }

    pub fn step(&self, key: &StepKey) -> Option<&ReasoningStep> {
        self.index.get(key).and_then(|&i| self.steps.get(i))
    }

    pub fn open_steps(&self) -> impl Iterator<Item = &ReasoningStep> {
        self.steps.iter().filter(|s| s.is_pending())
    }

    /// Tokens of every model call seen, attributed to a step or not.
    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    /// Tokens of calls that ended with no thinking step open.
    pub fn unattributed_tokens(&self) -> u64 {
        self.unattributed_tokens
    }

    /// The execution ended, normally or not.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn last_error(&self) -> Option<&(ErrorKind, String)> {
        self.last_error.as_ref()
    }

    /// Highest sequence applied.
    pub fn last_sequence(&self) -> Option<u64> {
        self.last_sequence
    }

    /// Accept the next envelope whatever its sequence, for a stream that
    /// restarts numbering (a resync against a recreated channel).
    pub fn reset_sequence(&mut self) {
        self.last_sequence = None;
    }

    /// Apply one envelope. Input is expected in sequence order; an envelope
    /// at or below the last applied sequence is ignored and `false` returned.
    pub fn apply(&mut self, env: &Envelope) -> bool {
        if self.last_sequence.is_some_and(|last| env.sequence <= last) {
            return false;
        }
        self.last_sequence = Some(env.sequence);
        match &env.event {
            Event::GraphStart => {
                self.finished = false;
            }
            Event::GenerationStart { .. } | Event::ToolStart { .. } | Event::NodeStart { .. } => self.open_step(env),
            Event::GenerationEnd {
                model,
                output_preview,
                usage,
                call_id,
                ..
            } => self.end_generation(env, model, output_preview, usage.total(), call_id.as_ref()),
            Event::ToolEnd {
                tool_name,
                result_preview,
            } => self.end_tool(env, tool_name, result_preview),
            Event::NodeEnd { node } => self.end_node(env, node),
            Event::ContentChunk { accumulated, .. } => {
                let lane = self.lane(env.scope());
                if let Some(step) = self.open_step_in(&lane, StepKind::Thinking) {
                    step.output_preview = Some(accumulated.clone());
                }
            }
            Event::StateSnapshot(snapshot) => self.merge_snapshot(snapshot, env.timestamp),
            Event::GraphEnd { .. } => self.terminate(env.timestamp),
            Event::Error { kind, message } => {
                if kind.is_transport() {
                    self.interrupt_open(env.timestamp);
                } else {
                    self.error_close(env.timestamp);
                }
                self.last_error = Some((*kind, message.clone()));
                if kind.is_terminal() {
                    self.finished = true;
                }
            }
            Event::Keepalive => {}
        }
        true
    }

    fn lane(&self, scope: Option<&str>) -> Lane {
        match self.policy {
            OpenStepPolicy::Single => None,
            OpenStepPolicy::PerScope => scope.map(str::to_owned),
        }
    }

    fn open_step_in(&mut self, lane: &Lane, kind: StepKind) -> Option<&mut ReasoningStep> {
        let &i = self.index.get(self.open.get(lane)?)?;
        self.steps.get_mut(i).filter(|s| s.kind == kind && s.is_open())
    }

    fn open_step(&mut self, env: &Envelope) {
        let Some(opening) = env.opening_step() else {
            return;
        };
        if self.index.contains_key(&opening.key) {
            return;
        }
        let lane = self.lane(env.scope());
        if let Some(current) = self.open.remove(&lane) {
            if let Some(step) = self.index.get(&current).and_then(|&i| self.steps.get_mut(i)) {
                if step.close(env.timestamp, StepStatus::Completed) && step.kind == StepKind::NodeExecution {
                    step.force_closed = true;
                }
            }
        }

        let ordinal = self.steps.len() + 1;
        self.index.insert(opening.key.clone(), self.steps.len());
        if let Event::NodeStart { node } = &env.event {
            self.open_nodes.insert((lane.clone(), node.clone()), opening.key.clone());
        }
        self.open.insert(lane, opening.key.clone());
        self.steps.push(ReasoningStep {
            id: opening.key,
            ordinal,
            kind: opening.kind,
            label: opening.label,
            status: StepStatus::Pending,
            start_time: env.timestamp,
            end_time: None,
            token_count: 0,
            input_preview: opening.input_preview,
            output_preview: None,
            run_id: env.run_id.clone(),
            task_id: env.task_id.clone(),
            force_closed: false,
            interrupted: false,
        });
    }

    fn end_generation(
        &mut self,
        env: &Envelope,
        model: &str,
        output_preview: &str,
        tokens: u64,
        call_id: Option<&CallId>,
    ) {
        if let Some(call_id) = call_id {
            if !self.counted_calls.insert(call_id.clone()) {
                return;
            }
        }
        self.total_tokens = self.total_tokens.saturating_add(tokens);

        let lane = self.lane(env.scope());
        let by_call = call_id.map(|c| StepKey::derive(StepKind::Thinking.as_str(), env.scope(), model, c.as_str()));
        let target = match self.open.get(&lane) {
            Some(key) if self.step(key).is_some_and(|s| s.kind == StepKind::Thinking && s.is_open()) => {
                Some(key.clone())
            }
            _ => by_call.filter(|key| self.step(key).is_some_and(ReasoningStep::is_open)),
        };
        let Some(key) = target else {
            self.unattributed_tokens = self.unattributed_tokens.saturating_add(tokens);
            return;
        };
        if let Some(step) = self.index.get(&key).and_then(|&i| self.steps.get_mut(i)) {
            step.token_count = step.token_count.saturating_add(tokens);
            step.output_preview = Some(output_preview.to_owned());
            step.close(env.timestamp, StepStatus::Completed);
        }
        if self.open.get(&lane) == Some(&key) {
            self.open.remove(&lane);
        }
    }

    fn end_tool(&mut self, env: &Envelope, tool_name: &str, result_preview: &str) {
        let lane = self.lane(env.scope());
        let scope = env.scope();
        let open_match = self
            .open
            .get(&lane)
            .filter(|key| {
                self.step(key)
                    .is_some_and(|s| s.kind == StepKind::ToolCall && s.is_open() && s.label == tool_name)
            })
            .cloned();
        let key = open_match.or_else(|| {
            self.steps
                .iter()
                .rev()
                .find(|s| s.kind == StepKind::ToolCall && s.is_open() && s.label == tool_name && s.scope() == scope)
                .map(|s| s.id.clone())
        });
        let Some(key) = key else {
            return;
        };
        if let Some(step) = self.index.get(&key).and_then(|&i| self.steps.get_mut(i)) {
            step.output_preview = Some(result_preview.to_owned());
            step.close(env.timestamp, StepStatus::Completed);
        }
        self.open.retain(|_, k| *k != key);
    }

    fn end_node(&mut self, env: &Envelope, node: &NodeId) {
        let lane = self.lane(env.scope());
        let Some(key) = self.open_nodes.remove(&(lane, node.clone())) else {
            return;
        };
        if let Some(step) = self.index.get(&key).and_then(|&i| self.steps.get_mut(i)) {
            if !step.close(env.timestamp, StepStatus::Completed) && step.force_closed {
                step.end_time = Some(env.timestamp);
            }
        }
        self.open.retain(|_, k| *k != key);
    }

    fn merge_snapshot(&mut self, snapshot: &StateSnapshot, at: DateTime<Utc>) {
        for record in &snapshot.task_history {
            match self.index.get(&record.id) {
                Some(&i) => {
                    if let Some(step) = self.steps.get_mut(i) {
                        step.absorb_record(record);
                    }
                }
                None => {
                    let mut step = ReasoningStep {
                        id: record.id.clone(),
                        ordinal: self.steps.len() + 1,
                        kind: record.kind,
                        label: record.label.clone(),
                        status: record.status,
                        start_time: record.started_at,
                        end_time: record.ended_at,
                        token_count: 0,
                        input_preview: None,
                        output_preview: None,
                        run_id: None,
                        task_id: None,
                        force_closed: false,
                        interrupted: false,
                    };
                    step.absorb_record(record);
                    self.index.insert(record.id.clone(), self.steps.len());
                    self.steps.push(step);
                }
            }
        }
        self.add_visited_nodes(snapshot, at);
        self.rebuild_open();
        if snapshot.is_final() {
            self.terminate(at);
        }
    }

    /// Visited nodes the snapshot has no task record for, and no node step
    /// here covers, become node steps. They are completed unless the node is
    /// also pending.
    fn add_visited_nodes(&mut self, snapshot: &StateSnapshot, at: DateTime<Utc>) {
        for node in &snapshot.visited_nodes {
            let known = self
                .steps
                .iter()
                .any(|s| s.kind == StepKind::NodeExecution && s.label == node.as_str());
            if known {
                continue;
            }
            let pending = snapshot.next_nodes.contains(node);
            let id = StepKey::derive(StepKind::NodeExecution.as_str(), None, node.as_str(), "visited");
            self.index.insert(id.clone(), self.steps.len());
            self.steps.push(ReasoningStep {
                id,
                ordinal: self.steps.len() + 1,
                kind: StepKind::NodeExecution,
                label: node.as_str().to_owned(),
                status: if pending { StepStatus::Pending } else { StepStatus::Completed },
                start_time: at,
                end_time: (!pending).then_some(at),
                token_count: 0,
                input_preview: None,
                output_preview: None,
                run_id: None,
                task_id: None,
                force_closed: false,
                interrupted: false,
            });
        }
    }

    /// Re-derive the open lanes from open steps after a snapshot.
    fn rebuild_open(&mut self) {
        self.open.clear();
        self.open_nodes.clear();
        for step in self.steps.iter().filter(|s| s.is_open()) {
            let lane = match self.policy {
                OpenStepPolicy::Single => None,
                OpenStepPolicy::PerScope => step.scope().map(str::to_owned),
            };
            if step.kind == StepKind::NodeExecution {
                self.open_nodes
                    .insert((lane.clone(), NodeId::from(step.label.as_str())), step.id.clone());
            }
            self.open.insert(lane, step.id.clone());
        }
    }

    fn terminate(&mut self, at: DateTime<Utc>) {
        for step in &mut self.steps {
            step.close(at, StepStatus::Completed);
        }
        self.open.clear();
        self.open_nodes.clear();
        self.finished = true;
    }

    /// Error-close open steps but keep their lanes, so a late close event
    /// still finds them.
    fn interrupt_open(&mut self, at: DateTime<Utc>) {
        for step in &mut self.steps {
            step.interrupt(at);
        }
    }

    fn error_close(&mut self, at: DateTime<Utc>) {
        for step in &mut self.steps {
            step.close(at, StepStatus::Errored);
        }
        self.open.clear();
        self.open_nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use skein_core::events::{Origin, ToolCallPreview};
    use skein_core::usage::TokenUsage;

    struct Stream {
        origin: Origin,
        seq: u64,
    }

    impl Stream {
        fn new() -> Self {
            Self {
                origin: Origin::thread("t".into()),
                seq: 0,
            }
        }

        fn scoped(mut self, task: &str) -> Self {
            self.origin = self.origin.with_task(task.into());
            self
        }

        fn at(&mut self, event: Event) -> Envelope {
            let mut env = Envelope::new(&self.origin, self.seq, event);
            env.timestamp = Utc.timestamp_opt(1_700_000_000 + self.seq as i64, 0).unwrap();
            self.seq += 1;
            env
        }
    }

    fn node_start(n: &str) -> Event {
        Event::NodeStart { node: n.into() }
    }

    fn node_end(n: &str) -> Event {
        Event::NodeEnd { node: n.into() }
    }

    fn tool_start(name: &str, args: &str) -> Event {
        Event::ToolStart {
            tool_name: name.into(),
            args_preview: args.into(),
        }
    }

    fn tool_end(name: &str) -> Event {
        Event::ToolEnd {
            tool_name: name.into(),
            result_preview: "ok".into(),
        }
    }

    fn gen_start(model: &str) -> Event {
        Event::GenerationStart {
            model: model.into(),
            input_preview: "prompt".into(),
            call_id: None,
        }
    }

    fn gen_end(model: &str, tokens: u64) -> Event {
        Event::GenerationEnd {
            model: model.into(),
            output_preview: "answer".into(),
            usage: TokenUsage {
                input_tokens: tokens,
                ..Default::default()
            },
            tool_calls: Vec::<ToolCallPreview>::new(),
            call_id: None,
            duration_ms: None,
            time_to_first_token_ms: None,
        }
    }

    fn run(policy: OpenStepPolicy, envs: &[Envelope]) -> Reconstructor {
        let mut r = Reconstructor::new(policy);
        for env in envs {
            r.apply(env);
        }
        r
    }

    #[test]
    fn tool_start_closes_open_node_and_node_end_extends_it() {
        let mut s = Stream::new();
        let envs = vec![
            s.at(node_start("n1")),
            s.at(tool_start("t1", "{}")),
            s.at(tool_end("t1")),
            s.at(node_end("n1")),
        ];
        let r = run(OpenStepPolicy::Single, &envs);
        let steps = r.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!((steps[0].ordinal, steps[0].kind, steps[0].label.as_str()), (1, StepKind::NodeExecution, "n1"));
        assert_eq!((steps[1].ordinal, steps[1].kind, steps[1].label.as_str()), (2, StepKind::ToolCall, "t1"));
        assert!(steps.iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(steps[0].end_time, Some(envs[3].timestamp));
        assert_eq!(steps[1].end_time, Some(envs[2].timestamp));
    }

    #[test]
    fn opening_event_force_closes_at_its_timestamp() {
        let mut s = Stream::new();
        let envs = vec![s.at(gen_start("m")), s.at(tool_start("search", "q"))];
        let r = run(OpenStepPolicy::Single, &envs);
        assert_eq!(r.steps()[0].status, StepStatus::Completed);
        assert_eq!(r.steps()[0].end_time, Some(envs[1].timestamp));
        assert!(r.steps()[1].is_pending());
    }

    #[test]
    fn reapplied_opening_event_is_deduplicated() {
        let mut s = Stream::new();
        let start = s.at(tool_start("search", "q"));
        let end = s.at(tool_end("search"));
        // Same step key at a later sequence.
        let again = s.at(tool_start("search", "q"));
        let r = run(OpenStepPolicy::Single, &[start.clone(), end, start, again]);
        assert_eq!(r.steps().len(), 1);
        assert_eq!(r.steps()[0].status, StepStatus::Completed);
    }

    #[test]
    fn stale_envelopes_are_ignored() {
        let mut s = Stream::new();
        let first = s.at(tool_start("search", "q1"));
        let end = s.at(tool_end("search"));
        let second = s.at(tool_start("search", "q2"));
        let mut r = run(OpenStepPolicy::Single, &[first, end.clone(), second]);

        assert!(!r.apply(&end));
        assert!(r.steps()[1].is_pending());
        assert_eq!(r.last_sequence(), Some(2));

        let late_gen = Envelope::new(&s.origin, 1, gen_end("m", 50));
        assert!(!r.apply(&late_gen));
        assert_eq!(r.total_tokens(), 0);
    }

    #[test]
    fn reset_sequence_accepts_a_restarted_stream() {
        let mut s = Stream::new();
        s.seq = 40;
        let mut r = run(OpenStepPolicy::Single, &[s.at(node_start("a"))]);
        r.reset_sequence();
        let restarted = Envelope::new(&s.origin, 0, node_end("a"));
        assert!(r.apply(&restarted));
        assert_eq!(r.steps()[0].status, StepStatus::Completed);
    }

    #[test]
    fn tokens_attach_to_open_thinking_step() {
        let mut s = Stream::new();
        let envs = vec![s.at(gen_start("m")), s.at(gen_end("m", 40)), s.at(gen_end("m", 7))];
        let r = run(OpenStepPolicy::Single, &envs);
        assert_eq!(r.steps()[0].token_count, 40);
        assert_eq!(r.steps()[0].output_preview.as_deref(), Some("answer"));
        assert_eq!(r.total_tokens(), 47);
        assert_eq!(r.unattributed_tokens(), 7);
    }

    #[test]
    fn content_chunks_update_the_live_preview() {
        let mut s = Stream::new();
        let envs = vec![
            s.at(gen_start("m")),
            s.at(Event::ContentChunk {
                delta: "Hel".into(),
                accumulated: "Hel".into(),
            }),
        ];
        let r = run(OpenStepPolicy::Single, &envs);
        assert_eq!(r.steps()[0].output_preview.as_deref(), Some("Hel"));
    }

    #[test]
    fn per_scope_keeps_concurrent_tools_open() {
        let mut a = Stream::new().scoped("a");
        let mut b = Stream::new().scoped("b");
        b.seq = 10;
        let envs = vec![
            a.at(tool_start("fetch", "1")),
            b.at(tool_start("fetch", "2")),
            b.at(tool_end("fetch")),
        ];

        let per_scope = run(OpenStepPolicy::PerScope, &envs);
        assert_eq!(per_scope.steps().len(), 2);
        assert!(per_scope.steps()[0].is_pending());
        assert_eq!(per_scope.steps()[1].status, StepStatus::Completed);

        let single = run(OpenStepPolicy::Single, &envs);
        assert_eq!(single.steps().len(), 2);
        assert_eq!(single.steps()[0].end_time, Some(envs[1].timestamp));
    }

    #[test]
    fn final_snapshot_completes_every_pending_step() {
        let mut s = Stream::new();
        let mut envs = vec![s.at(node_start("n")), s.at(tool_start("x", "y"))];
        envs.push(s.at(Event::StateSnapshot(StateSnapshot::default())));
        let r = run(OpenStepPolicy::Single, &envs);
        assert!(r.is_finished());
        assert!(r.steps().iter().all(|s| s.status == StepStatus::Completed));
        assert_eq!(r.steps()[1].end_time, Some(envs[2].timestamp));
    }

    #[test]
    fn graph_end_completes_pending_steps() {
        let mut s = Stream::new();
        let envs = vec![s.at(gen_start("m")), s.at(Event::GraphEnd { response: "done".into() })];
        let r = run(OpenStepPolicy::Single, &envs);
        assert!(r.is_finished());
        assert_eq!(r.steps()[0].status, StepStatus::Completed);
    }

    #[test]
    fn thread_error_error_closes_open_steps() {
        let mut s = Stream::new();
        let envs = vec![
            s.at(tool_start("a", "1")),
            s.at(tool_end("a")),
            s.at(tool_start("b", "2")),
            s.at(Event::Error {
                kind: ErrorKind::Stalled,
                message: "idle".into(),
            }),
        ];
        let r = run(OpenStepPolicy::Single, &envs);
        assert_eq!(r.steps()[0].status, StepStatus::Completed);
        assert_eq!(r.steps()[1].status, StepStatus::Errored);
        assert!(!r.is_finished());

        let mut fatal = envs.clone();
        fatal.push(s.at(Event::Error {
            kind: ErrorKind::EngineFailure,
            message: "boom".into(),
        }));
        let r = run(OpenStepPolicy::Single, &fatal);
        assert!(r.is_finished());
        assert_eq!(r.last_error().map(|e| e.0), Some(ErrorKind::EngineFailure));
    }

    #[test]
    fn transport_error_is_settled_by_late_close_events() {
        let mut s = Stream::new();
        let envs = vec![
            s.at(Event::GraphStart),
            s.at(tool_start("slow", "{}")),
            s.at(Event::Error {
                kind: ErrorKind::Stalled,
                message: "idle".into(),
            }),
        ];
        let mut r = run(OpenStepPolicy::Single, &envs);
        assert_eq!(r.steps()[0].status, StepStatus::Errored);
        assert_eq!(r.open_steps().count(), 0);

        let end = s.at(tool_end("slow"));
        r.apply(&end);
        assert_eq!(r.steps()[0].status, StepStatus::Completed);
        assert_eq!(r.steps()[0].end_time, Some(end.timestamp));
        assert_eq!(r.steps()[0].output_preview.as_deref(), Some("ok"));

        r.apply(&s.at(Event::GraphEnd { response: "done".into() }));
        assert!(r.is_finished());
        assert_eq!(r.steps()[0].status, StepStatus::Completed);
    }

    #[test]
    fn transport_error_then_terminal_event_completes() {
        let mut s = Stream::new();
        let envs = vec![
            s.at(node_start("n")),
            s.at(Event::Error {
                kind: ErrorKind::Undelivered,
                message: "lost".into(),
            }),
            s.at(Event::GraphEnd { response: "done".into() }),
        ];
        let r = run(OpenStepPolicy::Single, &envs);
        assert_eq!(r.steps()[0].status, StepStatus::Completed);
    }

    #[test]
    fn engine_failure_after_a_stall_stays_errored() {
        let mut s = Stream::new();
        let envs = vec![
            s.at(tool_start("slow", "{}")),
            s.at(Event::Error {
                kind: ErrorKind::Timeout,
                message: "budget".into(),
            }),
            s.at(Event::Error {
                kind: ErrorKind::EngineFailure,
                message: "boom".into(),
            }),
            s.at(tool_end("slow")),
        ];
        let r = run(OpenStepPolicy::Single, &envs);
        assert_eq!(r.steps()[0].status, StepStatus::Errored);
        assert!(r.is_finished());
    }

    #[test]
    fn visited_nodes_without_records_complete() {
        let mut s = Stream::new();
        let snapshot = s.at(Event::StateSnapshot(StateSnapshot {
            next_nodes: vec![],
            visited_nodes: vec!["A".into(), "B".into(), "C".into()],
            task_history: vec![],
            edges: vec![],
        }));
        let r = run(OpenStepPolicy::Single, &[snapshot]);
        let got: Vec<_> = r
            .steps()
            .iter()
            .map(|s| (s.ordinal, s.kind, s.label.as_str(), s.status))
            .collect();
        assert_eq!(
            got,
            vec![
                (1, StepKind::NodeExecution, "A", StepStatus::Completed),
                (2, StepKind::NodeExecution, "B", StepStatus::Completed),
                (3, StepKind::NodeExecution, "C", StepStatus::Completed),
            ]
        );
        assert_eq!(r.open_steps().count(), 0);
        assert!(r.is_finished());
    }

    #[test]
    fn visited_node_already_seen_is_not_repeated() {
        let mut s = Stream::new();
        let envs = vec![
            s.at(node_start("A")),
            s.at(node_end("A")),
            s.at(Event::StateSnapshot(StateSnapshot {
                next_nodes: vec!["B".into()],
                visited_nodes: vec!["A".into(), "B".into()],
                task_history: vec![],
                edges: vec![],
            })),
        ];
        let r = run(OpenStepPolicy::Single, &envs);
        assert_eq!(r.steps().len(), 2);
        assert_eq!(r.steps()[0].label, "A");
        assert!(r.steps()[1].is_pending());
        assert!(!r.is_finished());
    }

    #[test]
    fn snapshot_records_upsert_with_authoritative_status() {
        let mut s = Stream::new();
        let start = s.at(tool_start("search", "q"));
        let key = start.opening_step().unwrap().key;
        let stall = s.at(Event::Error {
            kind: ErrorKind::Disconnected,
            message: "gone".into(),
        });

        let record = |id: StepKey, label: &str, status| TaskRecord {
            id,
            kind: StepKind::ToolCall,
            label: label.into(),
            status,
            started_at: start.timestamp,
            ended_at: None,
            token_count: 0,
            input_preview: Some("q".into()),
            output_preview: None,
            run_id: None,
            task_id: None,
        };
        let other = StepKey::derive("tool_call", None, "fetch", "u");
        let snapshot = s.at(Event::StateSnapshot(StateSnapshot {
            next_nodes: vec!["research".into()],
            visited_nodes: vec![],
            task_history: vec![
                record(key.clone(), "search", StepStatus::Pending),
                record(other.clone(), "fetch", StepStatus::Completed),
            ],
            edges: vec![],
        }));

        let mut r = run(OpenStepPolicy::Single, &[start, stall, snapshot]);
        assert_eq!(r.steps().len(), 2);
        assert!(r.step(&key).unwrap().is_pending());
        assert_eq!(r.step(&other).unwrap().ordinal, 2);

        r.apply(&s.at(tool_end("search")));
        assert_eq!(r.step(&key).unwrap().status, StepStatus::Completed);
    }

    #[test]
    fn nothing_is_open_after_termination() {
        let mut s = Stream::new();
        let envs = vec![s.at(node_start("a")), s.at(Event::GraphEnd { response: String::new() })];
        let r = run(OpenStepPolicy::PerScope, &envs);
        assert_eq!(r.open_steps().count(), 0);
    }

    fn noisy_script() -> Vec<Envelope> {
        let mut s = Stream::new();
        vec![
            s.at(Event::GraphStart),
            s.at(node_start("plan")),
            s.at(gen_start("m")),
            s.at(gen_end("m", 12)),
            s.at(tool_start("search", "a")),
            s.at(tool_end("search")),
            s.at(tool_start("search", "b")),
            s.at(tool_end("search")),
            s.at(gen_end("m", 5)),
            s.at(node_end("plan")),
            s.at(Event::GraphEnd { response: "done".into() }),
        ]
    }

    proptest! {
        #[test]
        fn duplicated_envelopes_apply_once(resends in proptest::collection::vec((0usize..11, 0usize..11), 0..24)) {
            let envs = noisy_script();
            let clean = run(OpenStepPolicy::Single, &envs);

            // Each (at, of) re-sends envs[of] right after envs[at].
            let mut noisy = Reconstructor::new(OpenStepPolicy::Single);
            for (i, env) in envs.iter().enumerate() {
                noisy.apply(env);
                for &(at, of) in &resends {
                    if at == i {
                        noisy.apply(&envs[of.min(i)]);
                    }
                }
            }

            prop_assert_eq!(clean.steps(), noisy.steps());
            prop_assert_eq!(clean.total_tokens(), noisy.total_tokens());
            prop_assert_eq!(clean.unattributed_tokens(), noisy.unattributed_tokens());
        }
    }
}
