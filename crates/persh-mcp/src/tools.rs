//! Tool declarations and dispatch for `tools/list` and `tools/call`.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::hosts::{HostProfile, HostUpdate};
use crate::protocol::{McpTool, ToolCallResult};
use crate::service::SessionService;

pub const START_SESSION: &str = "ssh_start_session";
pub const EXECUTE: &str = "ssh_execute";
pub const CLOSE_SESSION: &str = "ssh_close_session";
pub const LIST_SESSIONS: &str = "ssh_list_sessions";
pub const ADD_HOST: &str = "ssh_add_host";
pub const UPDATE_HOST: &str = "ssh_update_host";
pub const REMOVE_HOST: &str = "ssh_remove_host";
pub const LIST_HOSTS: &str = "ssh_list_hosts";

/// A call that never reached a tool. Reported as a JSON-RPC error.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionArgs {
    host_id: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteArgs {
    session_id: String,
    command: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionArgs {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddHostArgs {
    host_id: String,
    #[serde(flatten)]
    profile: HostProfile,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateHostArgs {
    host_id: String,
    #[serde(flatten)]
    update: HostUpdate,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostArgs {
    host_id: String,
}

fn profile_properties() -> Value {
    json!({
        "host": { "type": "string", "description": "Hostname or IP address" },
        "port": { "type": "integer", "minimum": 1, "maximum": 65535, "description": "SSH port (default 22)" },
        "username": { "type": "string", "description": "Login name" },
        "password": { "type": "string", "description": "Password (takes precedence over keyPath)" },
        "keyPath": { "type": "string", "description": "Private key path, ~ allowed" },
        "passphrase": { "type": "string", "description": "Passphrase for an encrypted key" }
    })
}

fn host_schema(required: &[&str]) -> Value {
    let mut properties = profile_properties();
    properties["hostId"] = json!({ "type": "string", "description": "Host profile id" });
    json!({ "type": "object", "properties": properties, "required": required })
}

/// Every tool this server offers.
pub fn definitions() -> Vec<McpTool> {
    let tool = |name: &str, description: &str, input_schema: Value| McpTool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    };

    vec![
        tool(
            START_SESSION,
            "Open a persistent shell on a stored host. Working directory, environment and background jobs persist across ssh_execute calls.",
            json!({
                "type": "object",
                "properties": {
                    "hostId": { "type": "string", "description": "Host profile id" },
                    "sessionId": { "type": "string", "description": "Optional id for the new session" }
                },
                "required": ["hostId"]
            }),
        ),
        tool(
            EXECUTE,
            "Run a command in a session and return its output. A non-zero exit code is reported as an error with the output attached.",
            json!({
                "type": "object",
                "properties": {
                    "sessionId": { "type": "string" },
                    "command": { "type": "string", "description": "Shell command line" }
                },
                "required": ["sessionId", "command"]
            }),
        ),
        tool(
            CLOSE_SESSION,
            "Close a session and its SSH connection.",
            json!({
                "type": "object",
                "properties": { "sessionId": { "type": "string" } },
                "required": ["sessionId"]
            }),
        ),
        tool(
            LIST_SESSIONS,
            "List open sessions.",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            ADD_HOST,
            "Store a new host profile.",
            host_schema(&["hostId", "host", "username"]),
        ),
        tool(
            UPDATE_HOST,
            "Change fields of a stored host profile. An empty string clears password, keyPath or passphrase.",
            host_schema(&["hostId"]),
        ),
        tool(
            REMOVE_HOST,
            "Delete a stored host profile.",
            json!({
                "type": "object",
                "properties": { "hostId": { "type": "string" } },
                "required": ["hostId"]
            }),
        ),
        tool(
            LIST_HOSTS,
            "List stored host profiles without secrets.",
            json!({ "type": "object", "properties": {} }),
        ),
    ]
}

fn parse<T: DeserializeOwned>(tool: &str, arguments: Value) -> Result<T, ToolError> {
    let arguments = if arguments.is_null() { json!({}) } else { arguments };
    serde_json::from_value(arguments).map_err(|err| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: err.to_string(),
    })
}

fn failed(err: &persh::Error) -> ToolCallResult {
    ToolCallResult::error(err.to_string())
}

fn to_json_text(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Runs one tool. Domain failures come back as `isError` results.
///
/// # Errors
///
/// Returns [`ToolError`] for unknown tools and malformed arguments.
pub async fn call(
    service: &SessionService,
    name: &str,
    arguments: Value,
) -> Result<ToolCallResult, ToolError> {
    debug!(tool = name, "Tool call");

    let result = match name {
        START_SESSION => {
            let args: StartSessionArgs = parse(name, arguments)?;
            match service
                .start_session(&args.host_id, args.session_id.as_deref())
                .await
            {
                Ok(id) => ToolCallResult::text(format!("Session started: {id}")),
                Err(err) => failed(&err),
            }
        }
        EXECUTE => {
            let args: ExecuteArgs = parse(name, arguments)?;
            match service.execute(&args.session_id, &args.command).await {
                Ok(out) if out.success() => {
                    if out.output.is_empty() {
                        ToolCallResult::text("(no output)")
                    } else {
                        ToolCallResult::text(out.output)
                    }
                }
                Ok(out) => ToolCallResult::error(
                    format!("Command exited with code {}\n{}", out.exit_code, out.output)
                        .trim_end()
                        .to_string(),
                ),
                Err(err) => failed(&err),
            }
        }
        CLOSE_SESSION => {
            let args: SessionArgs = parse(name, arguments)?;
            match service.close_session(&args.session_id) {
                Ok(()) => ToolCallResult::text(format!("Session closed: {}", args.session_id)),
                Err(err) => failed(&err),
            }
        }
        LIST_SESSIONS => {
            let sessions: Vec<Value> = service
                .list_sessions()
                .into_iter()
                .map(|info| {
                    json!({
                        "id": info.id.as_str(),
                        "host": info.host,
                        "port": info.port,
                        "username": info.username,
                        "uptime": info.uptime.as_secs(),
                        "idle": info.idle_time.as_secs(),
                        "lastCommand": info.last_command,
                        "state": info.state.as_str(),
                    })
                })
                .collect();
            ToolCallResult::text(to_json_text(&Value::Array(sessions)))
        }
        ADD_HOST => {
            let args: AddHostArgs = parse(name, arguments)?;
            match service.hosts().add(&args.host_id, args.profile) {
                Ok(()) => ToolCallResult::text(format!("Host added: {}", args.host_id)),
                Err(err) => failed(&err),
            }
        }
        UPDATE_HOST => {
            let args: UpdateHostArgs = parse(name, arguments)?;
            match service.hosts().update(&args.host_id, args.update) {
                Ok(_) => ToolCallResult::text(format!("Host updated: {}", args.host_id)),
                Err(err) => failed(&err),
            }
        }
        REMOVE_HOST => {
            let args: HostArgs = parse(name, arguments)?;
            match service.hosts().remove(&args.host_id) {
                Ok(()) => ToolCallResult::text(format!("Host removed: {}", args.host_id)),
                Err(err) => failed(&err),
            }
        }
        LIST_HOSTS => {
            let hosts = serde_json::to_value(service.hosts().list()).unwrap_or_default();
            ToolCallResult::text(to_json_text(&hosts))
        }
        other => return Err(ToolError::UnknownTool(other.to_string())),
    };

    Ok(result)
}
