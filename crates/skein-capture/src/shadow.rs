//! Producer-side shadow of each thread's execution state.
//!
//! Fed every stamped envelope in sequence order, so a snapshot taken at
//! sequence `S` reflects exactly the events before `S`.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use skein_core::events::{Envelope, Event, StateSnapshot, StepKind, StepStatus, TaskRecord, START_NODE};
use skein_core::ids::{NodeId, StepKey, ThreadId};
use skein_core::sink::{EventObserver, SnapshotSource};

type Scope = Option<String>;

#[derive(Default)]
struct ThreadShadow {
    terminal: bool,
    visited: Vec<NodeId>,
    edges: BTreeSet<(NodeId, NodeId)>,
    last_node: Option<NodeId>,
    reported_next: Option<Vec<NodeId>>,
    open_nodes: HashMap<(Scope, NodeId), StepKey>,
    open_calls: HashMap<Scope, StepKey>,
    tasks: Vec<TaskRecord>,
    index: HashMap<StepKey, usize>,
}

impl ThreadShadow {
    fn apply(&mut self, env: &Envelope) {
        if self.terminal {
            return;
        }
        let scope: Scope = env.scope().map(str::to_owned);

        if let Some(step) = env.opening_step() {
            if let Event::NodeStart { node } = &env.event {
                self.visit(node);
            }
            if self.index.contains_key(&step.key) {
                return;
            }
            match step.kind {
                StepKind::NodeExecution => {
                    self.open_nodes
                        .insert((scope, NodeId::from_raw(step.label.clone())), step.key.clone());
                }
                StepKind::Thinking | StepKind::ToolCall => {
                    if let Some(prev) = self.open_calls.insert(scope, step.key.clone()) {
                        self.close(&prev, env.timestamp, StepStatus::Completed, |_| {});
                    }
                }
            }
            self.index.insert(step.key.clone(), self.tasks.len());
            self.tasks.push(TaskRecord {
                id: step.key,
                kind: step.kind,
                label: step.label,
                status: StepStatus::Pending,
                started_at: env.timestamp,
                ended_at: None,
                token_count: 0,
                input_preview: step.input_preview,
                output_preview: None,
                run_id: env.run_id.clone(),
                task_id: env.task_id.clone(),
            });
            return;
        }

        match &env.event {
            Event::GenerationEnd {
                output_preview, usage, ..
            } => {
                if let Some(key) = self.take_open_call(&scope, StepKind::Thinking, None) {
                    let tokens = usage.total();
                    self.close(&key, env.timestamp, StepStatus::Completed, |r| {
                        r.token_count = tokens;
                        r.output_preview = Some(output_preview.clone());
                    });
                }
            }
            Event::ToolEnd {
                tool_name,
                result_preview,
            } => {
                let key = self
                    .take_open_call(&scope, StepKind::ToolCall, Some(tool_name))
                    .or_else(|| self.latest_pending_tool(&scope, tool_name));
                if let Some(key) = key {
                    self.close(&key, env.timestamp, StepStatus::Completed, |r| {
                        r.output_preview = Some(result_preview.clone());
                    });
                }
            }
            Event::NodeEnd { node } => {
                if let Some(key) = self.open_nodes.remove(&(scope, node.clone())) {
                    self.close(&key, env.timestamp, StepStatus::Completed, |_| {});
                }
            }
            Event::GraphEnd { .. } => self.finish(env.timestamp, StepStatus::Completed),
            Event::Error { kind, .. } if kind.is_terminal() => self.finish(env.timestamp, StepStatus::Errored),
            Event::StateSnapshot(snapshot) if snapshot.is_final() => {
                self.finish(env.timestamp, StepStatus::Completed)
            }
            _ => {}
        }
    }

    fn visit(&mut self, node: &NodeId) {
        if !self.visited.contains(node) {
            self.visited.push(node.clone());
        }
        if let Some(prev) = self.last_node.replace(node.clone()) {
            self.edges.insert((prev, node.clone()));
        }
    }

    fn take_open_call(&mut self, scope: &Scope, kind: StepKind, label: Option<&str>) -> Option<StepKey> {
        let key = self.open_calls.get(scope)?;
        let record = self.tasks.get(*self.index.get(key)?)?;
        if record.kind != kind || label.is_some_and(|l| l != record.label) {
            return None;
        }
        self.open_calls.remove(scope)
    }

    fn latest_pending_tool(&self, scope: &Scope, tool_name: &str) -> Option<StepKey> {
        self.tasks
            .iter()
            .rev()
            .find(|r| {
                r.kind == StepKind::ToolCall
                    && r.status == StepStatus::Pending
                    && r.label == tool_name
                    && record_scope(r) == scope.as_deref()
            })
            .map(|r| r.id.clone())
    }

    fn close(&mut self, key: &StepKey, at: DateTime<Utc>, status: StepStatus, update: impl FnOnce(&mut TaskRecord)) {
        let Some(record) = self.index.get(key).and_then(|i| self.tasks.get_mut(*i)) else {
            return;
        };
        if record.status != StepStatus::Pending {
            return;
        }
        record.status = status;
        record.ended_at = Some(at);
        update(record);
    }

    fn finish(&mut self, at: DateTime<Utc>, status: StepStatus) {
        for record in self.tasks.iter_mut().filter(|r| r.status == StepStatus::Pending) {
            record.status = status;
            record.ended_at = Some(at);
        }
        self.open_calls.clear();
        self.open_nodes.clear();
        self.terminal = true;
    }

    fn pending_nodes(&self) -> Vec<NodeId> {
        if self.terminal {
            return Vec::new();
        }
        let mut pending = self.reported_next.clone().unwrap_or_default();
        let mut running: Vec<&NodeId> = self.open_nodes.keys().map(|(_, node)| node).collect();
        running.sort();
        for node in running {
            if !pending.contains(node) {
                pending.push(node.clone());
            }
        }
        if pending.is_empty() {
            pending.push(self.last_node.clone().unwrap_or_else(|| NodeId::from(START_NODE)));
        }
        pending
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            next_nodes: self.pending_nodes(),
            visited_nodes: self.visited.clone(),
            task_history: self.tasks.clone(),
            edges: self.edges.iter().cloned().collect(),
        }
    }
}

fn record_scope(record: &TaskRecord) -> Option<&str> {
    record
        .task_id
        .as_ref()
        .map(|t| t.as_str())
        .or_else(|| record.run_id.as_ref().map(|r| r.as_str()))
}

/// Shadow state for every live thread.
#[derive(Default)]
pub struct ShadowStore {
    threads: DashMap<ThreadId, ThreadShadow>,
}

impl ShadowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduler state as reported by the engine.
    pub fn report_state(&self, thread_id: &ThreadId, next_nodes: &[NodeId], visited_nodes: &[NodeId]) {
        let mut shadow = self.threads.entry(thread_id.clone()).or_default();
        shadow.reported_next = Some(next_nodes.to_vec());
        for node in visited_nodes {
            if !shadow.visited.contains(node) {
                shadow.visited.push(node.clone());
            }
        }
    }

    pub fn is_terminal(&self, thread_id: &ThreadId) -> bool {
        self.threads.get(thread_id).is_some_and(|s| s.terminal)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

impl EventObserver for ShadowStore {
    fn observe(&self, envelope: &Envelope) {
        if !envelope.event.is_substantive() {
            return;
        }
        self.threads.entry(envelope.thread_id.clone()).or_default().apply(envelope);
    }
}

impl SnapshotSource for ShadowStore {
    fn snapshot(&self, thread_id: &ThreadId) -> Option<StateSnapshot> {
        self.threads.get(thread_id).map(|s| s.snapshot())
    }

    fn release(&self, thread_id: &ThreadId) {
        self.threads.remove(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_core::errors::ErrorKind;
    use skein_core::events::Origin;
    use skein_core::ids::TaskId;
    use skein_core::usage::TokenUsage;

    struct Feed {
        store: ShadowStore,
        origin: Origin,
        seq: u64,
    }

    impl Feed {
        fn new() -> Self {
            Self {
                store: ShadowStore::new(),
                origin: Origin::thread("t1".into()),
                seq: 0,
            }
        }

        fn push(&mut self, event: Event) {
            let env = Envelope::new(&self.origin, self.seq, event);
            self.seq += 1;
            self.store.observe(&env);
        }

        fn snap(&self) -> StateSnapshot {
            self.store.snapshot(&"t1".into()).unwrap()
        }
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

    #[test]
    fn unknown_thread_has_no_snapshot() {
        assert!(ShadowStore::new().snapshot(&"nope".into()).is_none());
    }

    #[test]
    fn records_nodes_and_tools() {
        let mut f = Feed::new();
        f.push(Event::GraphStart);
        f.push(Event::NodeStart { node: "plan".into() });
        f.push(tool_start("search", "{}"));
        f.push(tool_end("search"));
        f.push(Event::NodeEnd { node: "plan".into() });
        f.push(Event::NodeStart { node: "act".into() });

        let snap = f.snap();
        assert_eq!(snap.visited_nodes, vec![NodeId::from("plan"), NodeId::from("act")]);
        assert_eq!(snap.edges, vec![(NodeId::from("plan"), NodeId::from("act"))]);
        assert_eq!(snap.task_history.len(), 3);
        assert_eq!(snap.task_history[0].status, StepStatus::Completed);
        assert_eq!(snap.task_history[1].kind, StepKind::ToolCall);
        assert_eq!(snap.task_history[1].output_preview.as_deref(), Some("ok"));
        assert_eq!(snap.task_history[2].status, StepStatus::Pending);
        assert_eq!(snap.next_nodes, vec![NodeId::from("act")]);
        assert!(!snap.is_final());
    }

    #[test]
    fn running_thread_without_nodes_is_not_final() {
        let mut f = Feed::new();
        f.push(Event::GraphStart);
        assert_eq!(f.snap().next_nodes, vec![NodeId::from(START_NODE)]);
    }

    #[test]
    fn generation_tokens_land_on_thinking_step() {
        let mut f = Feed::new();
        f.push(Event::GenerationStart {
            model: "m".into(),
            input_preview: "hi".into(),
            call_id: Some("c1".into()),
        });
        f.push(Event::GenerationEnd {
            model: "m".into(),
            output_preview: "hello".into(),
            usage: TokenUsage {
                input_tokens: 3,
                output_tokens: 4,
                ..Default::default()
            },
            tool_calls: vec![],
            call_id: Some("c1".into()),
            duration_ms: None,
            time_to_first_token_ms: None,
        });
        let rec = &f.snap().task_history[0];
        assert_eq!(rec.token_count, 7);
        assert_eq!(rec.status, StepStatus::Completed);
    }

    #[test]
    fn concurrent_scoped_tools_close_independently() {
        let mut f = Feed::new();
        f.origin = Origin::thread("t1".into()).with_task(TaskId::from("a"));
        f.push(tool_start("fetch", "1"));
        f.origin = Origin::thread("t1".into()).with_task(TaskId::from("b"));
        f.push(tool_start("fetch", "2"));
        f.push(tool_end("fetch"));

        let snap = f.snap();
        assert_eq!(snap.task_history.len(), 2);
        assert_eq!(snap.task_history[0].status, StepStatus::Pending);
        assert_eq!(snap.task_history[1].status, StepStatus::Completed);
    }

    #[test]
    fn reported_state_drives_next_nodes() {
        let mut f = Feed::new();
        f.push(Event::GraphStart);
        f.store.report_state(&"t1".into(), &["review".into()], &["plan".into()]);
        let snap = f.snap();
        assert_eq!(snap.next_nodes, vec![NodeId::from("review")]);
        assert_eq!(snap.visited_nodes, vec![NodeId::from("plan")]);
    }

    #[test]
    fn graph_end_completes_everything() {
        let mut f = Feed::new();
        f.push(Event::NodeStart { node: "plan".into() });
        f.push(tool_start("x", ""));
        f.push(Event::GraphEnd { response: "done".into() });
        let snap = f.snap();
        assert!(snap.is_final());
        assert!(snap.task_history.iter().all(|r| r.status == StepStatus::Completed));
        assert!(f.store.is_terminal(&"t1".into()));
    }

    #[test]
    fn engine_failure_errors_pending_steps() {
        let mut f = Feed::new();
        f.push(Event::NodeStart { node: "plan".into() });
        f.push(Event::Error {
            kind: ErrorKind::Stalled,
            message: "transport".into(),
        });
        assert_eq!(f.snap().task_history[0].status, StepStatus::Pending);
        f.push(Event::Error {
            kind: ErrorKind::EngineFailure,
            message: "boom".into(),
        });
        assert_eq!(f.snap().task_history[0].status, StepStatus::Errored);
    }

    #[test]
    fn release_forgets_thread() {
        let mut f = Feed::new();
        f.push(Event::GraphStart);
        assert_eq!(f.store.len(), 1);
        SnapshotSource::release(&f.store, &"t1".into());
        assert!(f.store.is_empty());
    }
}
