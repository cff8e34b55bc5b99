//! Subprocess backend client — JSON-RPC 2.0 over newline-delimited
//! stdin/stdout pipes.

use crate::protocol::*;
use crate::BackendClient;
use async_trait::async_trait;
use relay_core::{CapabilitySet, RelayError, RelayResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info};

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// The pieces that only exist while the subprocess is running.
struct LiveProcess {
    child: Child,
    stdin: ChildStdin,
    pending: PendingMap,
    reader: tokio::task::JoinHandle<()>,
}

/// Backend client that spawns an MCP server subprocess and speaks to it
/// over its pipes.
pub struct StdioClient {
    backend_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    next_id: AtomicU64,
    live: Option<LiveProcess>,
}

impl StdioClient {
    pub fn new(
        backend_id: &str,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            command,
            args,
            env,
            next_id: AtomicU64::new(1),
            live: None,
        }
    }

    fn spawn(&self) -> RelayResult<(Child, ChildStdin, tokio::process::ChildStdout)> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            // Backend diagnostics surface on the proxy's own stderr.
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);

        for (key, val) in &self.env {
            cmd.env(key, val);
        }

        let mut child = cmd.spawn().map_err(|e| {
            RelayError::Connection(format!("failed to spawn '{}': {e}", self.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RelayError::Connection("backend stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RelayError::Connection("backend stdout not available".into()))?;

        Ok((child, stdin, stdout))
    }

    /// Read stdout lines and resolve pending requests by id.
    fn spawn_reader(
        backend_id: String,
        stdout: tokio::process::ChildStdout,
        pending: PendingMap,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => {
                        debug!(backend = %backend_id, "backend stdout closed");
                        break;
                    }
                    Ok(_) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                            Ok(resp) => {
                                if let Some(id) = resp.id {
                                    let mut map = pending.lock().await;
                                    if let Some(tx) = map.remove(&id) {
                                        let _ = tx.send(resp);
                                    }
                                }
                                // Server-initiated notifications are dropped.
                            }
                            Err(e) => {
                                debug!(backend = %backend_id, line = %trimmed, error = %e,
                                    "non-JSON-RPC line from backend");
                            }
                        }
                    }
                    Err(e) => {
                        error!(backend = %backend_id, error = %e, "error reading backend stdout");
                        break;
                    }
                }
            }
            // Unblock any caller still waiting on a response.
            pending.lock().await.clear();
        })
    }

    async fn write_frame(&mut self, payload: &str) -> RelayResult<()> {
        let live = self
            .live
            .as_mut()
            .ok_or_else(|| RelayError::Connection("not connected".into()))?;
        live.stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|e| RelayError::Transport(format!("write to backend stdin failed: {e}")))?;
        live.stdin
            .write_all(b"\n")
            .await
            .map_err(|e| RelayError::Transport(format!("write to backend stdin failed: {e}")))?;
        live.stdin
            .flush()
            .await
            .map_err(|e| RelayError::Transport(format!("flush of backend stdin failed: {e}")))?;
        Ok(())
    }

    async fn request(
        &mut self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> RelayResult<JsonRpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_string(&req)?;

        let rx = {
            let live = self
                .live
                .as_ref()
                .ok_or_else(|| RelayError::Connection("not connected".into()))?;
            let (tx, rx) = oneshot::channel();
            let mut map = live.pending.lock().await;
            // A caller that gave up waiting leaves a dead sender behind.
            map.retain(|_, tx| !tx.is_closed());
            map.insert(id, tx);
            rx
        };

        if let Err(e) = self.write_frame(&payload).await {
            if let Some(live) = &self.live {
                live.pending.lock().await.remove(&id);
            }
            return Err(e);
        }

        rx.await
            .map_err(|_| RelayError::Transport("backend closed before responding".into()))
    }

    async fn handshake(&mut self) -> RelayResult<InitializeResult> {
        let init = self.request("initialize", Some(initialize_params())).await?;
        let result: InitializeResult = serde_json::from_value(expect_result(init)?)
            .map_err(|e| RelayError::Protocol(format!("malformed initialize result: {e}")))?;
        self.notify("notifications/initialized", serde_json::json!({}))
            .await?;
        Ok(result)
    }

    async fn notify(&mut self, method: &str, params: serde_json::Value) -> RelayResult<()> {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write_frame(&msg.to_string()).await
    }

    #[cfg(test)]
    async fn pending_len(&self) -> usize {
        match &self.live {
            Some(live) => live.pending.lock().await.len(),
            None => 0,
        }
    }
}

#[async_trait]
impl BackendClient for StdioClient {
    async fn connect(&mut self) -> RelayResult<()> {
        if self.live.is_some() {
            return Ok(());
        }

        let (child, stdin, stdout) = self.spawn()?;
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let reader = Self::spawn_reader(self.backend_id.clone(), stdout, pending.clone());

        self.live = Some(LiveProcess {
            child,
            stdin,
            pending,
            reader,
        });

        let result = match self.handshake().await {
            Ok(result) => result,
            Err(e) => {
                // A half-initialized subprocess must not look connected.
                self.disconnect().await;
                return Err(e);
            }
        };

        info!(
            backend = %self.backend_id,
            command = %self.command,
            version = %result.protocol_version,
            "stdio backend initialized"
        );
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.reader.abort();
            // Dropping stdin closes the pipe; killing is the backstop.
            if let Err(e) = live.child.start_kill() {
                debug!(backend = %self.backend_id, error = %e, "backend already exited");
            }
            live.pending.lock().await.clear();
            info!(backend = %self.backend_id, "stdio backend stopped");
        }
    }

    async fn list_capabilities(&mut self) -> RelayResult<CapabilitySet> {
        let tools = self.request("tools/list", None).await?;
        let prompts = self.request("prompts/list", None).await?;
        let resources = self.request("resources/list", None).await?;
        capability_set_from_listings(tools, prompts, resources)
    }

    async fn call_tool(
        &mut self,
        name: &str,
        arguments: serde_json::Value,
    ) -> RelayResult<serde_json::Value> {
        let resp = self
            .request("tools/call", Some(tool_call_params(name, arguments)))
            .await?;
        expect_result(resp)
    }

    async fn get_prompt(
        &mut self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> RelayResult<serde_json::Value> {
        let resp = self
            .request("prompts/get", Some(get_prompt_params(name, arguments)))
            .await?;
        expect_result(resp)
    }

    async fn read_resource(&mut self, uri: &str) -> RelayResult<serde_json::Value> {
        let resp = self
            .request("resources/read", Some(read_resource_params(uri)))
            .await?;
        expect_result(resp)
    }
}

impl Drop for StdioClient {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.reader.abort();
        }
    }
}
