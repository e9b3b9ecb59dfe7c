use crate::events::{Origin, ToolCallPreview};
use crate::ids::{CallId, NodeId};
use crate::usage::TokenUsage;

/// Where a hook fired: the emitting scope plus the model call, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HookContext {
    pub origin: Origin,
    pub call_id: Option<CallId>,
}

impl HookContext {
    pub fn new(origin: Origin) -> Self {
        Self { origin, call_id: None }
    }

    pub fn with_call(mut self, call_id: CallId) -> Self {
        self.call_id = Some(call_id);
        self
    }
}

/// Lifecycle callbacks invoked by the computation engine.
///
/// One method per event variant. Implementations run on the engine's own
/// context: they must return quickly and must not panic.
pub trait EngineHooks: Send + Sync {
    fn on_graph_start(&self, ctx: &HookContext);
    fn on_graph_end(&self, ctx: &HookContext, response: &str);
    fn on_node_start(&self, ctx: &HookContext, node: &NodeId);
    fn on_node_end(&self, ctx: &HookContext, node: &NodeId);
    fn on_generation_start(&self, ctx: &HookContext, model: &str, input: &str);
    fn on_generation_end(
        &self,
        ctx: &HookContext,
        model: &str,
        output: &str,
        usage: TokenUsage,
        tool_calls: &[ToolCallPreview],
    );
    fn on_tool_start(&self, ctx: &HookContext, tool_name: &str, args: &str);
    fn on_tool_end(&self, ctx: &HookContext, tool_name: &str, result: &str);
    fn on_content_chunk(&self, ctx: &HookContext, delta: &str);
    /// Engine-reported scheduler state. The receiver supplies task history.
    fn on_state(&self, ctx: &HookContext, next_nodes: &[NodeId], visited_nodes: &[NodeId]);
    fn on_error(&self, ctx: &HookContext, message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ThreadId;

    #[test]
    fn context_builders() {
        let ctx = HookContext::new(Origin::thread(ThreadId::from("t"))).with_call(CallId::from("c"));
        assert_eq!(ctx.origin.thread_id.as_str(), "t");
        assert_eq!(ctx.call_id.as_ref().map(|c| c.as_str()), Some("c"));
    }
}
