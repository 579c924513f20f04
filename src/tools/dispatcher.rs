//! # Tool Dispatcher
//!
//! Runs the tool calls the backend asks for and builds the single reply.
//!
//! ## Batch Flow:
//! 1. Raise the loading indicator with the first tool's name
//! 2. For each call: look up the handler, validate arguments, run it
//! 3. Any failure (unknown tool, bad arguments, handler error, panic) becomes an
//!    `{kind: "error", error}` result for that call only
//! 4. Errors and results with summary text are forwarded to the host UI
//! 5. Lower the loading indicator and return one response per call, in request order
//!
//! Calls in a batch run concurrently. The reply order follows the request order
//! regardless of which call finishes first.

use crate::events::{LoadingState, SessionEvents};
use crate::protocol::{FunctionCall, FunctionResponse, ToolResponse};
use crate::tools::pending::PendingRequests;
use crate::tools::schema::{validate_arguments, FunctionDeclaration};
use crate::tools::types::ToolResult;
use futures_util::future::{join_all, BoxFuture};
use futures_util::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Everything a handler may need besides its arguments.
#[derive(Clone)]
pub struct ToolContext {
    pub call_id: String,
    /// Language the user is speaking, e.g. "hi-IN"
    pub language_code: String,
    pub pending: PendingRequests,
    pub events: Arc<dyn SessionEvents>,
}

/// A callable tool.
///
/// The returned future must be `'static`; clone whatever the handler needs out of
/// `self` before building it.
pub trait ToolHandler: Send + Sync {
    fn declaration(&self) -> FunctionDeclaration;

    fn call(&self, args: Value, ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>>;
}

struct RegisteredTool {
    declaration: FunctionDeclaration,
    handler: Arc<dyn ToolHandler>,
}

/// Tools keyed by name, remembering registration order for the setup frame.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its declared name. Re-registering a name replaces
    /// the previous handler.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        let declaration = handler.declaration();
        let name = declaration.name.clone();
        if self.tools.insert(name.clone(), RegisteredTool { declaration, handler }).is_none() {
            self.order.push(name.clone());
        }
        debug!(tool = %name, "Registered tool");
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.declaration.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }
}

/// Executes tool batches. Cheap to clone; clones share the registry and the
/// pending-request table.
#[derive(Clone)]
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    pending: PendingRequests,
    events: Arc<dyn SessionEvents>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry, events: Arc<dyn SessionEvents>) -> Self {
        Self {
            registry: Arc::new(registry),
            pending: PendingRequests::new(),
            events,
        }
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.registry.declarations()
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Answer a tool that is waiting for a photo.
    pub fn complete_image_request(&self, call_id: &str, image: String) -> bool {
        self.pending.complete(call_id, image)
    }

    pub fn cancel_image_request(&self, call_id: &str) -> bool {
        self.pending.cancel(call_id)
    }

    /// Backend withdrew these calls; release anything parked under their ids.
    pub fn cancel_calls(&self, ids: &[String]) {
        for id in ids {
            if self.pending.cancel(id) {
                info!(call_id = %id, "Cancelled pending tool request");
            }
        }
    }

    /// Run one batch and build the reply.
    pub async fn dispatch(&self, calls: Vec<FunctionCall>, language_code: &str) -> ToolResponse {
        let label = calls.first().map(|c| c.name.clone()).unwrap_or_else(|| "Tool".to_string());
        info!(calls = calls.len(), first = %label, "Dispatching tool batch");
        self.events.set_loading(LoadingState::busy(label));

        let responses = join_all(calls.into_iter().map(|call| self.run_call(call, language_code))).await;

        self.events.set_loading(LoadingState::idle());
        ToolResponse {
            function_responses: responses,
        }
    }

    async fn run_call(&self, call: FunctionCall, language_code: &str) -> FunctionResponse {
        let result = self.execute(&call, language_code).await;

        if result.is_error() {
            warn!(tool = %call.name, call_id = %call.id, result = ?result, "Tool call failed");
        }
        if result.is_error() || result.summary().is_some() {
            self.events.on_tool_result_received(&result);
        }

        let response = serde_json::to_value(&result).unwrap_or_else(|e| {
            error!(tool = %call.name, error = %e, "Failed to serialize tool result");
            serde_json::json!({"kind": "error", "error": format!("Failed to serialize result: {}", e)})
        });

        FunctionResponse {
            id: call.id,
            name: call.name,
            response,
        }
    }

    async fn execute(&self, call: &FunctionCall, language_code: &str) -> ToolResult {
        let Some(tool) = self.registry.get(&call.name) else {
            return ToolResult::error(format!("Unknown tool: {}", call.name));
        };

        if let Err(reason) = validate_arguments(&tool.declaration, &call.args) {
            return ToolResult::error(reason);
        }

        let ctx = ToolContext {
            call_id: call.id.clone(),
            language_code: language_code.to_string(),
            pending: self.pending.clone(),
            events: self.events.clone(),
        };

        debug!(tool = %call.name, call_id = %call.id, "Running tool");
        let handler = tool.handler.clone();
        let args = call.args.clone();
        match AssertUnwindSafe(async move { handler.call(args, ctx).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ToolResult::error(e.to_string()),
            Err(panic) => ToolResult::error(format!("Tool {} panicked: {}", call.name, panic_message(&*panic))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingEvents;
    use crate::tools::schema::ParameterSchema;
    use crate::tools::types::MarketData;
    use serde_json::json;
    use std::time::Duration;

    /// Answers `{value: 1}` after an optional delay.
    struct KnownTool {
        delay_ms: u64,
    }

    impl ToolHandler for KnownTool {
        fn declaration(&self) -> FunctionDeclaration {
            FunctionDeclaration::new("known", "Returns a constant", ParameterSchema::object())
        }

        fn call(&self, _args: Value, _ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>> {
            let delay = self.delay_ms;
            async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let mut fields = serde_json::Map::new();
                fields.insert("value".to_string(), json!(1));
                Ok(ToolResult::Custom(fields))
            }
            .boxed()
        }
    }

    struct MarketTool;

    impl ToolHandler for MarketTool {
        fn declaration(&self) -> FunctionDeclaration {
            FunctionDeclaration::new(
                "get_mandi_prices",
                "Mandi prices",
                ParameterSchema::object()
                    .property("state", ParameterSchema::string("State"))
                    .required(&["state"]),
            )
        }

        fn call(&self, args: Value, _ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>> {
            let state = args["state"].as_str().unwrap_or_default().to_string();
            async move {
                Ok(ToolResult::MarketData(MarketData {
                    records: vec![],
                    summary: format!("Wheat in {} is steady", state),
                }))
            }
            .boxed()
        }
    }

    struct FailingTool;

    impl ToolHandler for FailingTool {
        fn declaration(&self) -> FunctionDeclaration {
            FunctionDeclaration::new("failing", "Always fails", ParameterSchema::object())
        }

        fn call(&self, _args: Value, _ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>> {
            async move { Err(anyhow::anyhow!("upstream API returned 503")) }.boxed()
        }
    }

    struct PanickingTool;

    impl ToolHandler for PanickingTool {
        fn declaration(&self) -> FunctionDeclaration {
            FunctionDeclaration::new("panicking", "Panics", ParameterSchema::object())
        }

        fn call(&self, _args: Value, _ctx: ToolContext) -> BoxFuture<'static, anyhow::Result<ToolResult>> {
            async move {
                let result: anyhow::Result<ToolResult> = panic!("index out of bounds");
                result
            }
            .boxed()
        }
    }

    fn dispatcher(events: Arc<RecordingEvents>) -> ToolDispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(KnownTool { delay_ms: 30 }));
        registry.register(Arc::new(MarketTool));
        registry.register(Arc::new(FailingTool));
        registry.register(Arc::new(PanickingTool));
        ToolDispatcher::new(registry, events)
    }

    fn call(id: &str, name: &str, args: Value) -> FunctionCall {
        FunctionCall {
            id: id.to_string(),
            name: name.to_string(),
            args,
        }
    }

    #[tokio::test]
    async fn test_batch_reply_keeps_request_order() {
        let events = Arc::new(RecordingEvents::default());
        let dispatcher = dispatcher(events.clone());

        let reply = dispatcher
            .dispatch(vec![call("1", "known", json!({})), call("2", "x", json!({}))], "hi-IN")
            .await;

        assert_eq!(reply.function_responses.len(), 2);
        assert_eq!(reply.function_responses[0].id, "1");
        assert_eq!(reply.function_responses[0].response, json!({"kind": "custom", "value": 1}));
        assert_eq!(reply.function_responses[1].id, "2");
        assert_eq!(reply.function_responses[1].name, "x");
        assert_eq!(reply.function_responses[1].response["error"], "Unknown tool: x");

        assert_eq!(
            events.loading(),
            vec![LoadingState::busy("known"), LoadingState::idle()]
        );
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_call() {
        let events = Arc::new(RecordingEvents::default());
        let dispatcher = dispatcher(events.clone());

        let reply = dispatcher
            .dispatch(
                vec![
                    call("a", "failing", json!({})),
                    call("b", "panicking", json!({})),
                    call("c", "get_mandi_prices", json!({"state": "Punjab"})),
                ],
                "en-IN",
            )
            .await;

        let responses = &reply.function_responses;
        assert_eq!(responses[0].response["error"], "upstream API returned 503");
        assert!(responses[1].response["error"].as_str().unwrap().contains("index out of bounds"));
        assert_eq!(responses[2].response["summary"], "Wheat in Punjab is steady");

        // Loading indicator always returns to idle
        assert_eq!(events.loading().last(), Some(&LoadingState::idle()));
    }

    #[tokio::test]
    async fn test_invalid_arguments_skip_the_handler() {
        let events = Arc::new(RecordingEvents::default());
        let dispatcher = dispatcher(events.clone());

        let reply = dispatcher.dispatch(vec![call("m", "get_mandi_prices", json!({}))], "hi-IN").await;
        assert_eq!(
            reply.function_responses[0].response["error"],
            "Missing or invalid 'state' argument for get_mandi_prices."
        );

        // The UI still hears about the rejected call
        let forwarded = events.tool_results();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(
            forwarded[0].error_message(),
            Some("Missing or invalid 'state' argument for get_mandi_prices.")
        );
    }

    #[tokio::test]
    async fn test_every_failure_kind_is_forwarded() {
        let events = Arc::new(RecordingEvents::default());
        let dispatcher = dispatcher(events.clone());

        dispatcher
            .dispatch(
                vec![
                    call("1", "missing_tool", json!({})),
                    call("2", "failing", json!({})),
                    call("3", "panicking", json!({})),
                ],
                "hi-IN",
            )
            .await;

        let forwarded = events.tool_results();
        assert_eq!(forwarded.len(), 3);
        assert!(forwarded.iter().all(ToolResult::is_error));
        assert_eq!(forwarded[0].error_message(), Some("Unknown tool: missing_tool"));
        assert_eq!(forwarded[1].error_message(), Some("upstream API returned 503"));
    }

    #[tokio::test]
    async fn test_results_without_summary_are_not_forwarded() {
        let events = Arc::new(RecordingEvents::default());
        let dispatcher = dispatcher(events.clone());

        dispatcher
            .dispatch(
                vec![
                    call("1", "known", json!({})),
                    call("2", "get_mandi_prices", json!({"state": "Bihar"})),
                ],
                "hi-IN",
            )
            .await;

        let forwarded = events.tool_results();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].summary().as_deref(), Some("Wheat in Bihar is steady"));
    }

    #[tokio::test]
    async fn test_empty_batch_uses_generic_label() {
        let events = Arc::new(RecordingEvents::default());
        let reply = dispatcher(events.clone()).dispatch(vec![], "hi-IN").await;
        assert!(reply.function_responses.is_empty());
        assert_eq!(events.loading()[0], LoadingState::busy("Tool"));
    }

    #[test]
    fn test_declarations_follow_registration_order() {
        let events = Arc::new(RecordingEvents::default());
        let names: Vec<String> = dispatcher(events).declarations().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["known", "get_mandi_prices", "failing", "panicking"]);
    }
}
