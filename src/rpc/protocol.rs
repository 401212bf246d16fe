// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wire types for the agent app-server JSON-RPC protocol.
//!
//! The protocol is JSON-RPC-2.0-shaped, spoken as line-delimited JSON over the
//! subprocess's stdin/stdout. The `"jsonrpc":"2.0"` header is OMITTED on the
//! wire; messages are classified by which top-level fields are present:
//!
//! | Fields present    | Interpretation                          |
//! |-------------------|-----------------------------------------|
//! | `id`, `method`    | request expecting a response            |
//! | `id`, `result`    | success response                        |
//! | `id`, `error`     | error response                          |
//! | `method`, no `id` | notification (fire-and-forget)          |

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// JSON-RPC envelope (without the jsonrpc field)
// ============================================================================

/// Request from client to server. IDs are assigned by the client as a
/// monotonically increasing integer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Successful response. The `id` echoes the request's; server-initiated
/// requests may use string IDs, so it is kept as a raw value here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    pub result: Value,
}

/// Error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: Value,
    pub error: RpcError,
}

/// Error body in a JSON-RPC error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC "method not found" error code.
pub const CODE_METHOD_NOT_FOUND: i64 = -32601;

impl RpcError {
    /// Create an error body with no data payload.
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Create a "method not found" error for an unknown server request.
    pub fn method_not_found(method: &str) -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, format!("unknown method: {method}"))
    }
}

/// Notification (no `id`, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

// ============================================================================
// Method names
// ============================================================================

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "initialized";
pub const METHOD_THREAD_START: &str = "thread/start";
pub const METHOD_TURN_START: &str = "turn/start";
pub const METHOD_TURN_INTERRUPT: &str = "turn/interrupt";

pub const NOTIFY_TURN_STARTED: &str = "turn/started";
pub const NOTIFY_TURN_COMPLETED: &str = "turn/completed";
pub const NOTIFY_ITEM_STARTED: &str = "item/started";
pub const NOTIFY_ITEM_COMPLETED: &str = "item/completed";
pub const NOTIFY_AGENT_MESSAGE_DELTA: &str = "item/agentMessageDelta";

pub const REQUEST_COMMAND_APPROVAL: &str = "command/approval";
pub const REQUEST_FILE_CHANGE_APPROVAL: &str = "fileChange/approval";

// ============================================================================
// Sandbox and approval values
// ============================================================================

/// Filesystem/command permissions an agent thread grants itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxMode {
    #[serde(rename = "read-only")]
    ReadOnly,
    #[serde(rename = "workspace-write")]
    WorkspaceWrite,
    #[serde(rename = "danger-full-access")]
    DangerFullAccess,
}

/// Decision sent in reply to a server-initiated approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalDecision {
    Accept,
    AcceptForSession,
    Decline,
    Cancel,
}

/// Reply body for both approval request kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub decision: ApprovalDecision,
}

// ============================================================================
// Initialize
// ============================================================================

/// Sent as the first request to the app-server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub client_info: ClientInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    #[serde(default)]
    pub user_agent: String,
}

// ============================================================================
// Thread
// ============================================================================

/// Creates a new conversation thread on the subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStartParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub developer_instructions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadStartResponse {
    pub thread: Thread,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    #[serde(default)]
    pub cwd: String,
}

// ============================================================================
// Turn
// ============================================================================

/// Sends user input and begins a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnStartParams {
    pub thread_id: String,
    pub input: Vec<InputItem>,
}

/// A single user input item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputItem {
    Text { text: String },
}

impl InputItem {
    /// Create a text input item.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnStartResponse {
    pub turn: Turn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TurnError>,
}

/// Lifecycle state of a turn as reported by the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnStatus {
    Completed,
    Interrupted,
    Failed,
    InProgress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_details: Option<String>,
}

/// Stops the current turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnInterruptParams {
    pub thread_id: String,
    pub turn_id: String,
}

// ============================================================================
// Notifications (server -> client)
// ============================================================================

/// Emitted when a turn begins or finishes. The same shape carries both
/// `turn/started` and `turn/completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnNotification {
    pub thread_id: String,
    pub turn: Turn,
}

/// Streams agent text output during a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageDelta {
    #[serde(default)]
    pub thread_id: String,
    #[serde(default)]
    pub turn_id: String,
    #[serde(default)]
    pub item_id: String,
    pub delta: String,
}
