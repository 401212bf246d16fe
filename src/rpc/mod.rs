// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON-RPC transport for agent app-server subprocesses.
//!
//! Agents are driven over a JSON-RPC-2.0-shaped protocol spoken as
//! line-delimited JSON on the child process's stdin/stdout. The `jsonrpc`
//! header is omitted on the wire; see [`protocol`] for the envelope rules.
//!
//! - [`protocol`] - wire envelope and app-server API types
//! - [`client`] - duplex client: calls, notifications, server requests
//! - [`process`] - subprocess spawn and teardown

pub mod client;
pub mod process;
pub mod protocol;

pub use client::{auto_approve_handler, NotificationHandler, RpcClient, RpcClientError, ServerRequestHandler};
pub use process::{AppServerProcess, SpawnOptions};
pub use protocol::{
    ApprovalDecision, ApprovalResponse, InputItem, RpcError, SandboxMode, ThreadStartParams,
    Turn, TurnNotification, TurnStartParams, TurnStatus,
};
