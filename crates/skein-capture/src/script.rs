//! A declarative stand-in for a computation engine.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use skein_core::events::{Origin, ToolCallPreview};
use skein_core::hooks::{EngineHooks, HookContext};
use skein_core::ids::{NodeId, RunId, TaskId, ThreadId};
use skein_core::usage::TokenUsage;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum ScriptStep {
    GraphStart,
    GraphEnd {
        response: String,
    },
    NodeStart {
        node: String,
    },
    NodeEnd {
        node: String,
    },
    Generation {
        model: String,
        input: String,
        #[serde(default)]
        chunks: Vec<String>,
        #[serde(default)]
        tool_calls: Vec<ToolCallPreview>,
        #[serde(default)]
        usage: TokenUsage,
        #[serde(default)]
        task_id: Option<String>,
    },
    Tool {
        name: String,
        args: String,
        result: String,
        #[serde(default)]
        task_id: Option<String>,
    },
    State {
        next: Vec<String>,
        visited: Vec<String>,
    },
    Fail {
        message: String,
    },
    Sleep {
        ms: u64,
    },
}

/// Drives [`EngineHooks`] from a list of steps with a fixed delay between them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptedRun {
    pub thread_id: ThreadId,
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    pub steps: Vec<ScriptStep>,
}

fn default_step_delay_ms() -> u64 {
    250
}

impl ScriptedRun {
    pub fn new(thread_id: ThreadId, steps: Vec<ScriptStep>) -> Self {
        Self {
            thread_id,
            run_id: None,
            step_delay_ms: default_step_delay_ms(),
            steps,
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay_ms = delay.as_millis() as u64;
        self
    }

    /// A plan → research → answer run with one tool call and two generations.
    pub fn demo(thread_id: ThreadId) -> Self {
        let usage = |input_tokens, output_tokens| TokenUsage {
            input_tokens,
            output_tokens,
            ..Default::default()
        };
        let steps = vec![
            ScriptStep::GraphStart,
            ScriptStep::NodeStart { node: "plan".into() },
            ScriptStep::Generation {
                model: "claude-sonnet-4".into(),
                input: "Outline the answer to: how do tides work?".into(),
                chunks: vec!["Look up ".into(), "lunar gravity, ".into(), "then summarize.".into()],
                tool_calls: vec![ToolCallPreview {
                    tool_name: "search".into(),
                    args_preview: "{\"q\":\"tidal forces\"}".into(),
                }],
                usage: usage(420, 38),
                task_id: None,
            },
            ScriptStep::NodeEnd { node: "plan".into() },
            ScriptStep::State {
                next: vec!["research".into()],
                visited: vec!["plan".into()],
            },
            ScriptStep::NodeStart {
                node: "research".into(),
            },
            ScriptStep::Tool {
                name: "search".into(),
                args: "{\"q\":\"tidal forces\"}".into(),
                result: "[3 results]".into(),
                task_id: None,
            },
            ScriptStep::NodeEnd {
                node: "research".into(),
            },
            ScriptStep::NodeStart { node: "answer".into() },
            ScriptStep::Generation {
                model: "claude-haiku-4".into(),
                input: "Summarize the search results.".into(),
                chunks: vec!["Tides come from ".into(), "the moon's pull.".into()],
                tool_calls: vec![],
                usage: usage(900, 64),
                task_id: None,
            },
            ScriptStep::NodeEnd { node: "answer".into() },
            ScriptStep::State {
                next: vec![],
                visited: vec!["plan".into(), "research".into(), "answer".into()],
            },
            ScriptStep::GraphEnd {
                response: "Tides come from the moon's pull.".into(),
            },
        ];
        Self::new(thread_id, steps)
    }

    fn context(&self, task_id: Option<&str>) -> HookContext {
        let mut origin = Origin::thread(self.thread_id.clone());
        origin.run_id = self.run_id.clone();
        origin.task_id = task_id.map(TaskId::from);
        HookContext::new(origin)
    }

    /// Run every step unless cancelled. Returns the number of steps run.
    pub async fn drive(&self, hooks: &dyn EngineHooks, cancel: &CancellationToken) -> usize {
        let delay = Duration::from_millis(self.step_delay_ms);
        let mut ran = 0;
        for step in &self.steps {
            if cancel.is_cancelled() {
                break;
            }
            self.run_step(step, hooks, delay).await;
            ran += 1;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        tracing::debug!(thread_id = %self.thread_id, steps = ran, "scripted run finished");
        ran
    }

    async fn run_step(&self, step: &ScriptStep, hooks: &dyn EngineHooks, delay: Duration) {
        let base = self.context(None);
        match step {
            ScriptStep::GraphStart => hooks.on_graph_start(&base),
            ScriptStep::GraphEnd { response } => hooks.on_graph_end(&base, response),
            ScriptStep::NodeStart { node } => hooks.on_node_start(&base, &NodeId::from(node.as_str())),
            ScriptStep::NodeEnd { node } => hooks.on_node_end(&base, &NodeId::from(node.as_str())),
            ScriptStep::Generation {
                model,
                input,
                chunks,
                tool_calls,
                usage,
                task_id,
            } => {
                let ctx = self.context(task_id.as_deref());
                hooks.on_generation_start(&ctx, model, input);
                for chunk in chunks {
                    tokio::time::sleep(delay / 4).await;
                    hooks.on_content_chunk(&ctx, chunk);
                }
                let output: String = chunks.concat();
                hooks.on_generation_end(&ctx, model, &output, *usage, tool_calls);
            }
            ScriptStep::Tool {
                name,
                args,
                result,
                task_id,
            } => {
                let ctx = self.context(task_id.as_deref());
                hooks.on_tool_start(&ctx, name, args);
                tokio::time::sleep(delay).await;
                hooks.on_tool_end(&ctx, name, result);
            }
            ScriptStep::State { next, visited } => {
                let next: Vec<NodeId> = next.iter().map(|n| NodeId::from(n.as_str())).collect();
                let visited: Vec<NodeId> = visited.iter().map(|n| NodeId::from(n.as_str())).collect();
                hooks.on_state(&base, &next, &visited);
            }
            ScriptStep::Fail { message } => hooks.on_error(&base, message),
            ScriptStep::Sleep { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
        }
    }
}
