#![allow(dead_code)]

use std::error::Error;
use std::path::PathBuf;

use rmcp::ServiceExt;
use rmcp::handler::client::ClientHandler;
use rmcp::model::{CallToolRequestParams, CallToolResult, RawContent};
use rmcp::service::{Peer, RoleClient, RunningService, ServiceError};
use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
use serde_json::Value;
use tokio::process::Command;

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[derive(Clone)]
struct TestClient;

impl ClientHandler for TestClient {}

pub struct McpTestSession {
    service: RunningService<RoleClient, TestClient>,
    server_pid: Option<u32>,
}

impl McpTestSession {
    pub fn server_info(&self) -> Option<&rmcp::model::ServerInfo> {
        self.service.peer_info()
    }

    /// A cloneable handle for issuing calls while another call is in flight.
    pub fn peer(&self) -> Peer<RoleClient> {
        self.service.peer().clone()
    }

    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolResult, ServiceError> {
        call_tool_on(&self.peer(), tool, arguments).await
    }

    pub async fn cancel(self) -> TestResult<()> {
        self.service.cancel().await?;
        if let Some(pid) = self.server_pid {
            terminate_process_tree(pid);
        }
        Ok(())
    }
}

pub async fn call_tool_on(
    peer: &Peer<RoleClient>,
    tool: &str,
    arguments: Value,
) -> Result<CallToolResult, ServiceError> {
    let arguments = match arguments {
        Value::Object(map) => Some(map),
        _ => None,
    };
    peer.call_tool(CallToolRequestParams {
        meta: None,
        name: tool.to_string().into(),
        arguments,
        task: None,
    })
    .await
}

pub fn result_text(result: &CallToolResult) -> String {
    result
        .content
        .iter()
        .filter_map(|item| match &item.raw {
            RawContent::Text(text) => Some(text.text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

pub fn fake_magma_script() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("fake_magma.sh")
}

/// Launches the server against the shell fixture in place of a real Magma install.
pub async fn spawn_server() -> TestResult<McpTestSession> {
    spawn_server_with_args(Vec::new()).await
}

pub async fn spawn_server_with_args(args: Vec<String>) -> TestResult<McpTestSession> {
    let exe = resolve_server_path()?;
    let script = fake_magma_script();
    let transport = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
        cmd.env_remove("MAGMA_REPL_PROGRAM");
        cmd.env_remove("MAGMA_REPL_PROMPT");
        cmd.env_remove("MAGMA_REPL_MAX_INPUT_LINE");
        cmd.arg("--program").arg("sh");
        cmd.arg("--program-arg").arg(&script);
        cmd.args(&args);
    }))?;

    let server_pid = transport.id();
    let service = TestClient.serve(transport).await?;
    Ok(McpTestSession {
        service,
        server_pid,
    })
}

fn resolve_server_path() -> TestResult<PathBuf> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_magma-repl") {
        return Ok(PathBuf::from(path));
    }

    let mut path = std::env::current_exe()?;
    path.pop();
    path.pop();
    path.push("magma-repl");
    if path.exists() {
        Ok(path)
    } else {
        Err("unable to locate magma-repl test binary".into())
    }
}

fn terminate_process_tree(pid: u32) {
    let pid_str = pid.to_string();
    let _ = std::process::Command::new("pkill")
        .args(["-TERM", "-P", &pid_str])
        .status();
    unsafe {
        let _ = libc::kill(pid as i32, libc::SIGTERM);
    }
    std::thread::sleep(std::time::Duration::from_millis(200));
    let alive = unsafe { libc::kill(pid as i32, 0) == 0 };
    if alive {
        unsafe {
            let _ = libc::kill(pid as i32, libc::SIGKILL);
        }
    }
}
