use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
pub use crate::ids::StepKey;
use crate::ids::{CallId, NodeId, RunId, TaskId, ThreadId};
use crate::usage::TokenUsage;

/// Every `type` tag the current event model understands.
pub const KNOWN_KINDS: &[&str] = &[
    "graph_start",
    "graph_end",
    "node_start",
    "node_end",
    "generation_start",
    "generation_end",
    "tool_start",
    "tool_end",
    "content_chunk",
    "state_snapshot",
    "error",
    "keepalive",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thinking,
    ToolCall,
    NodeExecution,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thinking => "thinking",
            Self::ToolCall => "tool_call",
            Self::NodeExecution => "node_execution",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Errored,
}

/// A tool call requested by a model generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPreview {
    pub tool_name: String,
    pub args_preview: String,
}

/// Producer-side record of one unit of work, carried in snapshots.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: StepKey,
    pub kind: StepKind,
    pub label: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub token_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

/// Full execution state, sufficient to rebuild a consumer from cold.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub next_nodes: Vec<NodeId>,
    pub visited_nodes: Vec<NodeId>,
    #[serde(default)]
    pub task_history: Vec<TaskRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edges: Vec<(NodeId, NodeId)>,
}

impl StateSnapshot {
    /// No pending nodes means the execution has finished.
    pub fn is_final(&self) -> bool {
        self.next_nodes.is_empty()
    }
}

/// Lifecycle events of one execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    GraphStart,
    GraphEnd {
        response: String,
    },
    NodeStart {
        node: NodeId,
    },
    NodeEnd {
        node: NodeId,
    },
    GenerationStart {
        model: String,
        input_preview: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    GenerationEnd {
        model: String,
        output_preview: String,
        #[serde(default)]
        usage: TokenUsage,
        #[serde(default)]
        tool_calls: Vec<ToolCallPreview>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time_to_first_token_ms: Option<u64>,
    },
    ToolStart {
        tool_name: String,
        args_preview: String,
    },
    ToolEnd {
        tool_name: String,
        result_preview: String,
    },
    ContentChunk {
        delta: String,
        accumulated: String,
    },
    StateSnapshot(StateSnapshot),
    Error {
        kind: ErrorKind,
        message: String,
    },
    Keepalive,
}

impl Event {
    /// Wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GraphStart => "graph_start",
            Self::GraphEnd { .. } => "graph_end",
            Self::NodeStart { .. } => "node_start",
            Self::NodeEnd { .. } => "node_end",
            Self::GenerationStart { .. } => "generation_start",
            Self::GenerationEnd { .. } => "generation_end",
            Self::ToolStart { .. } => "tool_start",
            Self::ToolEnd { .. } => "tool_end",
            Self::ContentChunk { .. } => "content_chunk",
            Self::StateSnapshot(_) => "state_snapshot",
            Self::Error { .. } => "error",
            Self::Keepalive => "keepalive",
        }
    }

    pub fn is_known_kind(kind: &str) -> bool {
        KNOWN_KINDS.contains(&kind)
    }

    /// Never dropped under queue pressure.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::GraphEnd { .. } | Self::Error { .. } | Self::StateSnapshot(_))
    }

    /// First candidates for eviction under queue pressure.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Keepalive | Self::ContentChunk { .. })
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::GraphEnd { .. } => true,
            Self::Error { kind, .. } => kind.is_terminal(),
            _ => false,
        }
    }

    /// Events that begin a reasoning step.
    pub fn is_opening(&self) -> bool {
        matches!(
            self,
            Self::GenerationStart { .. } | Self::ToolStart { .. } | Self::NodeStart { .. }
        )
    }

    pub fn is_substantive(&self) -> bool {
        !matches!(self, Self::Keepalive)
    }
}

/// Who emitted an event: the thread plus optional sub-execution scope.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Origin {
    pub thread_id: ThreadId,
    pub run_id: Option<RunId>,
    pub task_id: Option<TaskId>,
}

impl Origin {
    pub fn thread(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            run_id: None,
            task_id: None,
        }
    }

    pub fn with_run(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

/// A sequenced event as delivered to consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "crate::wire::WireEnvelope", try_from = "crate::wire::WireEnvelope")]
pub struct Envelope {
    pub thread_id: ThreadId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: Option<RunId>,
    pub task_id: Option<TaskId>,
    pub event: Event,
}

impl Envelope {
    pub fn new(origin: &Origin, sequence: u64, event: Event) -> Self {
        Self {
            thread_id: origin.thread_id.clone(),
            sequence,
            timestamp: Utc::now(),
            run_id: origin.run_id.clone(),
            task_id: origin.task_id.clone(),
            event,
        }
    }

    /// The narrowest scope the event was emitted under: task, then run.
    pub fn scope(&self) -> Option<&str> {
        self.task_id
            .as_ref()
            .map(|t| t.as_str())
            .or_else(|| self.run_id.as_ref().map(|r| r.as_str()))
    }

    pub fn origin(&self) -> Origin {
        Origin {
            thread_id: self.thread_id.clone(),
            run_id: self.run_id.clone(),
            task_id: self.task_id.clone(),
        }
    }

    /// The step an opening event begins, keyed the same way on both ends of
    /// the pipe.
    ///
    /// Thinking steps key on the call id when present, tool calls on their
    /// argument prefix, node executions on the opening sequence so that
    /// revisiting a node yields a new step.
    pub fn opening_step(&self) -> Option<OpeningStep> {
        let scope = self.scope();
        let (kind, label, detail, input_preview) = match &self.event {
            Event::GenerationStart {
                model,
                input_preview,
                call_id,
            } => {
                let detail = call_id.as_ref().map(|c| c.as_str().to_owned()).unwrap_or_else(|| input_preview.clone());
                (StepKind::Thinking, model.clone(), detail, Some(input_preview.clone()))
            }
            Event::ToolStart { tool_name, args_preview } => (
                StepKind::ToolCall,
                tool_name.clone(),
                args_preview.clone(),
                Some(args_preview.clone()),
            ),
            Event::NodeStart { node } => (
                StepKind::NodeExecution,
                node.as_str().to_owned(),
                self.sequence.to_string(),
                None,
            ),
            _ => return None,
        };
        Some(OpeningStep {
            key: StepKey::derive(kind.as_str(), scope, &label, &detail),
            kind,
            label,
            input_preview,
        })
    }
}

/// Identity and labels of the step an opening event begins.
#[derive(Clone, Debug, PartialEq)]
pub struct OpeningStep {
    pub key: StepKey,
    pub kind: StepKind,
    pub label: String,
    pub input_preview: Option<String>,
}

/// Placeholder pending node for a running execution that has not reported
/// scheduler state yet.
pub const START_NODE: &str = "__start__";
