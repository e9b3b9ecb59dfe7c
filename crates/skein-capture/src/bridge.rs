use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, warn};

use skein_core::errors::ErrorKind;
use skein_core::events::{Event, ToolCallPreview};
use skein_core::hooks::{EngineHooks, HookContext};
use skein_core::ids::{CallId, NodeId, ThreadId};
use skein_core::sink::{EmitOutcome, EventSink, SnapshotSource};
use skein_core::usage::TokenUsage;

use crate::preview::{preview, DEFAULT_PREVIEW_BYTES};
use crate::shadow::ShadowStore;

#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Byte budget of every preview field.
    pub preview_bytes: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preview_bytes: DEFAULT_PREVIEW_BYTES,
        }
    }
}

struct OpenCall {
    call_id: CallId,
    started: Instant,
    first_token: Option<Instant>,
    accumulated: String,
}

#[derive(Default)]
struct CallBook {
    issued: u64,
    open: HashMap<Option<String>, OpenCall>,
}

/// Turns engine hook invocations into sequenced events.
///
/// Each hook emits exactly one event. Besides enqueuing, the only work done
/// is bookkeeping for call ids, generation timing and previews.
pub struct CaptureBridge {
    sink: Arc<dyn EventSink>,
    shadow: Arc<ShadowStore>,
    config: CaptureConfig,
    calls: DashMap<ThreadId, CallBook>,
}

impl CaptureBridge {
    pub fn new(sink: Arc<dyn EventSink>, shadow: Arc<ShadowStore>, config: CaptureConfig) -> Self {
        Self {
            sink,
            shadow,
            config,
            calls: DashMap::new(),
        }
    }

    pub fn shadow(&self) -> &Arc<ShadowStore> {
        &self.shadow
    }

    fn preview(&self, text: &str) -> String {
        preview(text, self.config.preview_bytes)
    }

    fn emit(&self, ctx: &HookContext, event: Event) -> EmitOutcome {
        let kind = event.kind();
        let outcome = self.sink.emit(&ctx.origin, event);
        match outcome {
            EmitOutcome::Queued { .. } => {}
            EmitOutcome::Degraded { sequence, evicted } => {
                debug!(thread_id = %ctx.origin.thread_id, sequence, evicted, kind, "queue full, evicted older events");
            }
            EmitOutcome::Dropped { sequence } => {
                debug!(thread_id = %ctx.origin.thread_id, sequence, kind, "event dropped");
            }
            EmitOutcome::Undelivered { sequence } => {
                warn!(thread_id = %ctx.origin.thread_id, sequence, kind, "critical event undelivered");
            }
        }
        outcome
    }

    fn close_calls(&self, thread_id: &ThreadId) {
        self.calls.remove(thread_id);
    }
}

fn scope_of(ctx: &HookContext) -> Option<String> {
    ctx.origin
        .task_id
        .as_ref()
        .map(|t| t.as_str().to_owned())
        .or_else(|| ctx.origin.run_id.as_ref().map(|r| r.as_str().to_owned()))
}

fn millis(from: Instant, to: Instant) -> u64 {
    to.saturating_duration_since(from).as_millis() as u64
}

impl EngineHooks for CaptureBridge {
    fn on_graph_start(&self, ctx: &HookContext) {
        self.emit(ctx, Event::GraphStart);
    }

    fn on_graph_end(&self, ctx: &HookContext, response: &str) {
        self.close_calls(&ctx.origin.thread_id);
        self.emit(
            ctx,
            Event::GraphEnd {
                response: self.preview(response),
            },
        );
    }

    fn on_node_start(&self, ctx: &HookContext, node: &NodeId) {
        self.emit(ctx, Event::NodeStart { node: node.clone() });
    }

    fn on_node_end(&self, ctx: &HookContext, node: &NodeId) {
        self.emit(ctx, Event::NodeEnd { node: node.clone() });
    }

    fn on_generation_start(&self, ctx: &HookContext, model: &str, input: &str) {
        let scope = scope_of(ctx);
        let call_id = {
            let mut book = self.calls.entry(ctx.origin.thread_id.clone()).or_default();
            book.issued += 1;
            let call_id = ctx.call_id.clone().unwrap_or_else(|| {
                let base = scope.as_deref().unwrap_or(model);
                CallId::from_raw(format!("{base}#{}", book.issued))
            });
            book.open.insert(
                scope,
                OpenCall {
                    call_id: call_id.clone(),
                    started: Instant::now(),
                    first_token: None,
                    accumulated: String::new(),
                },
            );
            call_id
        };
        self.emit(
            ctx,
            Event::GenerationStart {
                model: model.to_owned(),
                input_preview: self.preview(input),
                call_id: Some(call_id),
            },
        );
    }

    fn on_generation_end(
        &self,
        ctx: &HookContext,
        model: &str,
        output: &str,
        usage: TokenUsage,
        tool_calls: &[ToolCallPreview],
    ) {
        let now = Instant::now();
        let scope = scope_of(ctx);
        let open = self
            .calls
            .get_mut(&ctx.origin.thread_id)
            .and_then(|mut book| book.open.remove(&scope));

        let (call_id, duration_ms, ttft_ms) = match open {
            Some(call) => (
                ctx.call_id.clone().unwrap_or(call.call_id),
                Some(millis(call.started, now)),
                call.first_token.map(|t| millis(call.started, t)),
            ),
            None => {
                let mut book = self.calls.entry(ctx.origin.thread_id.clone()).or_default();
                book.issued += 1;
                let issued = book.issued;
                drop(book);
                let call_id = ctx.call_id.clone().unwrap_or_else(|| {
                    CallId::from_raw(format!("{}#{issued}", scope.as_deref().unwrap_or(model)))
                });
                (call_id, None, None)
            }
        };

        let tool_calls = tool_calls
            .iter()
            .map(|tc| ToolCallPreview {
                tool_name: tc.tool_name.clone(),
                args_preview: self.preview(&tc.args_preview),
            })
            .collect();

        self.emit(
            ctx,
            Event::GenerationEnd {
                model: model.to_owned(),
                output_preview: self.preview(output),
                usage,
                tool_calls,
                call_id: Some(call_id),
                duration_ms,
                time_to_first_token_ms: ttft_ms,
            },
        );
    }

    fn on_tool_start(&self, ctx: &HookContext, tool_name: &str, args: &str) {
        self.emit(
            ctx,
            Event::ToolStart {
                tool_name: tool_name.to_owned(),
                args_preview: self.preview(args),
            },
        );
    }

    fn on_tool_end(&self, ctx: &HookContext, tool_name: &str, result: &str) {
        self.emit(
            ctx,
            Event::ToolEnd {
                tool_name: tool_name.to_owned(),
                result_preview: self.preview(result),
            },
        );
    }

    fn on_content_chunk(&self, ctx: &HookContext, delta: &str) {
        let scope = scope_of(ctx);
        let cap = self.config.preview_bytes.saturating_mul(2);
        let accumulated = self
            .calls
            .get_mut(&ctx.origin.thread_id)
            .and_then(|mut book| {
                book.open.get_mut(&scope).map(|call| {
                    call.first_token.get_or_insert_with(Instant::now);
                    if call.accumulated.len() < cap {
                        call.accumulated.push_str(delta);
                    }
                    self.preview(&call.accumulated)
                })
            })
            .unwrap_or_else(|| self.preview(delta));
        self.emit(
            ctx,
            Event::ContentChunk {
                delta: self.preview(delta),
                accumulated,
            },
        );
    }

    fn on_state(&self, ctx: &HookContext, next_nodes: &[NodeId], visited_nodes: &[NodeId]) {
        let thread_id = &ctx.origin.thread_id;
        self.shadow.report_state(thread_id, next_nodes, visited_nodes);
        let mut snapshot = self.shadow.snapshot(thread_id).unwrap_or_default();
        snapshot.next_nodes = next_nodes.to_vec();
        self.emit(ctx, Event::StateSnapshot(snapshot));
    }

    fn on_error(&self, ctx: &HookContext, message: &str) {
        self.close_calls(&ctx.origin.thread_id);
        self.emit(
            ctx,
            Event::Error {
                kind: ErrorKind::EngineFailure,
                message: self.preview(message),
            },
        );
    }
}
