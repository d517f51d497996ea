//! Newline-delimited JSON-RPC over a byte stream pair.
//!
//! Requests are read in order. `tools/call` runs in its own task so slow
//! commands in one session do not hold up others; every response goes
//! through a single writer task.

use std::io;

use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::protocol::{
    InitializeResult, JsonRpcRequest, JsonRpcResponse, MCP_PROTOCOL_VERSION, ServerCapabilities,
    ServerInfo, ToolCallRequest, ToolsCapability, error_codes,
};
use crate::service::SessionService;
use crate::tools;

/// The MCP server.
#[derive(Debug, Clone)]
pub struct McpServer {
    service: SessionService,
}

impl McpServer {
    pub fn new(service: SessionService) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &SessionService {
        &self.service
    }

    /// Serves requests from `reader` until EOF, then disposes every session
    /// and drains in-flight calls.
    ///
    /// # Errors
    ///
    /// Returns read or write failures on the underlying streams.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel::<JsonRpcResponse>();
        let writer_task = tokio::spawn(write_responses(writer, rx));
        let mut calls = JoinSet::new();
        let mut lines = reader.lines();

        let read_result = loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };
            if line.trim().is_empty() {
                continue;
            }

            let request = match parse_request(&line) {
                Ok(request) => request,
                Err(response) => {
                    let _ = tx.send(response);
                    continue;
                }
            };

            if request.method == "tools/call" {
                let server = self.clone();
                let tx = tx.clone();
                calls.spawn(async move {
                    if let Some(response) = server.handle(request).await {
                        let _ = tx.send(response);
                    }
                });
            } else if let Some(response) = self.handle(request).await {
                let _ = tx.send(response);
            }

            // Reap finished calls so the set does not grow without bound.
            while calls.try_join_next().is_some() {}
        };

        info!("Input closed, shutting down");
        self.service.shutdown();
        while calls.join_next().await.is_some() {}
        drop(tx);

        match writer_task.await {
            Ok(write_result) => write_result?,
            Err(err) => warn!(error = %err, "Response writer panicked"),
        }
        read_result
    }

    /// Handles one request. Returns `None` for notifications.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        debug!(method = %request.method, "Request");
        let JsonRpcRequest { id, method, params, .. } = request;

        let outcome = match method.as_str() {
            "initialize" => Ok(initialize_result()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tools::definitions() })),
            "tools/call" => self.call_tool(params).await,
            m if m.starts_with("notifications/") => return None,
            other => Err(JsonRpcResponse::error(
                None,
                error_codes::METHOD_NOT_FOUND,
                format!("method not found: {other}"),
            )),
        };

        // Notifications never get a response, even on error.
        let id = id?;
        Some(match outcome {
            Ok(result) => JsonRpcResponse::success(Some(id), result),
            Err(mut response) => {
                response.id = Some(id);
                response
            }
        })
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcResponse> {
        let invalid =
            |message: String| JsonRpcResponse::error(None, error_codes::INVALID_PARAMS, message);

        let call: ToolCallRequest = params
            .ok_or_else(|| invalid("missing params".to_string()))
            .and_then(|p| serde_json::from_value(p).map_err(|err| invalid(err.to_string())))?;

        match tools::call(&self.service, &call.name, call.arguments).await {
            Ok(result) => serde_json::to_value(result).map_err(|err| {
                JsonRpcResponse::error(None, error_codes::INTERNAL_ERROR, err.to_string())
            }),
            Err(err) => Err(invalid(err.to_string())),
        }
    }
}

fn initialize_result() -> Value {
    let result = InitializeResult {
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability::default()),
        },
        server_info: ServerInfo {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };
    serde_json::to_value(result).unwrap_or_default()
}

fn parse_request(line: &str) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = serde_json::from_str(line).map_err(|err| {
        warn!(error = %err, "Unparseable request");
        JsonRpcResponse::error(None, error_codes::PARSE_ERROR, format!("parse error: {err}"))
    })?;
    let id = value.get("id").cloned().filter(|id| !id.is_null());
    serde_json::from_value(value).map_err(|err| {
        JsonRpcResponse::error(
            id,
            error_codes::INVALID_REQUEST,
            format!("invalid request: {err}"),
        )
    })
}

async fn write_responses<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<JsonRpcResponse>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = serde_json::to_vec(&response).map_err(io::Error::other)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}
