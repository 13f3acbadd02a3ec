use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, ErrorData as McpError, Implementation, ProtocolVersion,
    ServerCapabilities, ServerInfo,
};
use rmcp::{ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};

mod response;

use self::response::{completion_reply_to_result, execute_reply_to_result};

use crate::bridge::{Bridge, InterruptHandle};
use crate::config::BridgeConfig;

#[derive(Clone)]
struct SharedServer {
    bridge: Arc<Mutex<Bridge>>,
    interrupt: InterruptHandle,
    summary: String,
}

impl SharedServer {
    fn new(bridge: Bridge) -> Self {
        let interrupt = bridge.interrupt_handle();
        let summary = bridge.summary();
        Self {
            bridge: Arc::new(Mutex::new(bridge)),
            interrupt,
            summary,
        }
    }

    async fn run_bridge<T, F>(&self, f: F) -> Result<T, McpError>
    where
        F: FnOnce(&mut Bridge) -> T + Send + 'static,
        T: Send + 'static,
    {
        let bridge = self.bridge.clone();
        tokio::task::spawn_blocking(move || {
            let mut bridge = bridge.lock().unwrap_or_else(|err| err.into_inner());
            f(&mut bridge)
        })
        .await
        .map_err(|err| McpError::internal_error(err.to_string(), None))
    }
}

fn log_tool_result(tool: &str, result: &Result<CallToolResult, McpError>) {
    match result {
        Ok(result) => crate::event_log::log_lazy("tool_call_end", || {
            let serialized = serde_json::to_value(result)
                .unwrap_or_else(|err| json!({"serialize_error": err.to_string()}));
            json!({
                "tool": tool,
                "result": serialized,
            })
        }),
        Err(err) => crate::event_log::log_lazy("tool_call_error", || {
            json!({
                "tool": tool,
                "error": err.to_string(),
            })
        }),
    }
}

#[derive(Clone)]
struct MagmaToolServer {
    shared: SharedServer,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl MagmaToolServer {
    fn new(bridge: Bridge) -> Self {
        Self {
            shared: SharedServer::new(bridge),
            tool_router: Self::tool_router(),
        }
    }

    #[doc = include_str!("../docs/tool-descriptions/magma_tool.md")]
    #[tool(name = "magma")]
    async fn magma(&self, params: Parameters<MagmaArgs>) -> Result<CallToolResult, McpError> {
        let MagmaArgs { code, silent } = params.0;
        crate::event_log::log_lazy("tool_call_begin", || {
            json!({
                "tool": "magma",
                "code": code.clone(),
                "silent": silent,
            })
        });
        let reply = self
            .shared
            .run_bridge(move |bridge| bridge.execute(&code, silent, &mut |_| {}))
            .await?;
        let result = Ok(execute_reply_to_result(reply));
        log_tool_result("magma", &result);
        result
    }

    #[doc = include_str!("../docs/tool-descriptions/magma_complete_tool.md")]
    #[tool(name = "magma_complete")]
    async fn magma_complete(
        &self,
        params: Parameters<CompleteArgs>,
    ) -> Result<CallToolResult, McpError> {
        let CompleteArgs { code, cursor_pos } = params.0;
        crate::event_log::log_lazy("tool_call_begin", || {
            json!({
                "tool": "magma_complete",
                "code": code.clone(),
                "cursor_pos": cursor_pos,
            })
        });
        let cursor = cursor_pos.unwrap_or_else(|| code.chars().count());
        let reply = self
            .shared
            .run_bridge(move |bridge| bridge.complete(&code, cursor))
            .await?;
        let result = Ok(completion_reply_to_result(&reply));
        log_tool_result("magma_complete", &result);
        result
    }

    #[doc = include_str!("../docs/tool-descriptions/magma_interrupt_tool.md")]
    #[tool(name = "magma_interrupt")]
    async fn magma_interrupt(
        &self,
        _params: Parameters<EmptyArgs>,
    ) -> Result<CallToolResult, McpError> {
        crate::event_log::log("tool_call_begin", json!({"tool": "magma_interrupt"}));
        self.shared.interrupt.request();
        Ok(CallToolResult::success(vec![Content::text(
            "interrupt requested",
        )]))
    }

    #[doc = include_str!("../docs/tool-descriptions/magma_reset_tool.md")]
    #[tool(name = "magma_reset")]
    async fn magma_reset(&self, _params: Parameters<EmptyArgs>) -> Result<CallToolResult, McpError> {
        crate::event_log::log("tool_call_begin", json!({"tool": "magma_reset"}));
        let outcome = self
            .shared
            .run_bridge(|bridge| bridge.reset().map(|()| bridge.summary()))
            .await?;
        let result = Ok(match outcome {
            Ok(summary) => CallToolResult::success(vec![Content::text(summary)]),
            Err(err) => {
                eprintln!("magma reset error: {err}");
                CallToolResult::error(vec![Content::text(format!("magma reset failed: {err}"))])
            }
        });
        log_tool_result("magma_reset", &result);
        result
    }
}

#[tool_handler]
impl ServerHandler for MagmaToolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(self.shared.summary.clone()),
            ..ServerInfo::default()
        }
    }
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct MagmaArgs {
    /// Magma statements to run. A trailing `;` is added when missing.
    code: String,
    /// Run without producing output or advancing the execution count.
    #[serde(default)]
    silent: bool,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct CompleteArgs {
    code: String,
    /// Cursor position in characters; defaults to the end of `code`.
    #[serde(default)]
    cursor_pos: Option<usize>,
}

#[derive(Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct EmptyArgs {}

pub async fn run(config: BridgeConfig) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("starting magma-repl server");
    crate::event_log::log(
        "server_run_begin",
        json!({
            "program": config.program.to_string_lossy(),
        }),
    );
    let bridge = tokio::task::spawn_blocking(move || Bridge::start(config)).await??;
    crate::diagnostics::startup_log(bridge.summary());
    let service = MagmaToolServer::new(bridge);
    let shutdown_bridge = service.shared.bridge.clone();

    crate::event_log::log("server_listen_begin", json!({}));
    let result: Result<(), Box<dyn std::error::Error>> = async {
        let running = rmcp::serve_server(service, rmcp::transport::stdio()).await?;
        running
            .waiting()
            .await
            .map(|_| ())
            .map_err(|err| err.into())
    }
    .await;

    shutdown_bridge
        .lock()
        .unwrap_or_else(|err| err.into_inner())
        .shutdown();
    match &result {
        Ok(()) => crate::event_log::log("server_listen_end", json!({"status": "ok"})),
        Err(err) => crate::event_log::log(
            "server_listen_end",
            json!({
                "status": "error",
                "error": err.to_string(),
            }),
        ),
    }
    result
}
