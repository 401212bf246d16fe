// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! JSON-RPC client for the agent app-server subprocess.
//!
//! The client owns the write half of the subprocess's stdin and a reader task
//! over its stdout. Calls register a single-shot delivery slot keyed by the
//! request ID; the reader task resolves slots as responses arrive, forwards
//! notifications to the notification handler, and answers server-initiated
//! requests (approvals) in a freshly spawned task so a slow handler never
//! blocks further reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::protocol::{
    ApprovalDecision, ApprovalResponse, ErrorResponse, InitializeParams, InitializeResponse,
    Notification, Request, Response, RpcError, ThreadStartParams, ThreadStartResponse,
    TurnInterruptParams, TurnStartParams, TurnStartResponse, METHOD_INITIALIZE,
    METHOD_INITIALIZED, METHOD_THREAD_START, METHOD_TURN_INTERRUPT, METHOD_TURN_START,
    REQUEST_COMMAND_APPROVAL, REQUEST_FILE_CHANGE_APPROVAL,
};
use crate::VERSION;

/// Error type for RPC client operations.
#[derive(Debug, thiserror::Error)]
pub enum RpcClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("client closed")]
    ClientClosed,

    #[error("cancelled")]
    Cancelled,
}

/// Handler invoked for every server notification.
pub type NotificationHandler = Arc<dyn Fn(&str, Value) + Send + Sync>;

/// Handler for server-initiated requests (approvals). Returns the result
/// payload, or an [`RpcError`] which is sent back as an error response.
pub type ServerRequestHandler =
    Arc<dyn Fn(&str, Value) -> Result<Value, RpcError> + Send + Sync>;

/// Outcome delivered through a pending-call slot.
enum SlotResult {
    Ok(Value),
    Rpc(RpcError),
    /// The transport terminated with the call outstanding.
    Closed,
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct ClientInner {
    /// Write half of the subprocess stdin. `None` once closed; writes are
    /// serialised by this mutex so encoder output can never interleave.
    writer: Mutex<Option<Writer>>,
    /// Pending calls by request ID.
    pending: Mutex<HashMap<i64, oneshot::Sender<SlotResult>>>,
    next_id: AtomicI64,
    notify_handler: Mutex<Option<NotificationHandler>>,
    request_handler: Mutex<Option<ServerRequestHandler>>,
    /// Cancelled when the reader hits EOF or a fatal error.
    done: CancellationToken,
}

/// JSON-RPC client over a child process's stdio pipes.
///
/// Cheap to clone; all clones share the same transport.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Create a client over the given stream halves and start its reader.
    pub fn new(
        writer: impl AsyncWrite + Send + Unpin + 'static,
        reader: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        let inner = Arc::new(ClientInner {
            writer: Mutex::new(Some(Box::new(writer))),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(0),
            notify_handler: Mutex::new(None),
            request_handler: Mutex::new(None),
            done: CancellationToken::new(),
        });

        tokio::spawn(Self::read_loop(Arc::clone(&inner), Box::new(reader)));

        Self { inner }
    }

    /// Set the handler for server notifications.
    pub async fn set_notification_handler(&self, handler: NotificationHandler) {
        let mut guard = self.inner.notify_handler.lock().await;
        *guard = Some(handler);
    }

    /// Set the handler for server-initiated requests.
    pub async fn set_server_request_handler(&self, handler: ServerRequestHandler) {
        let mut guard = self.inner.request_handler.lock().await;
        *guard = Some(handler);
    }

    /// Check whether the transport has terminated.
    pub fn is_closed(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// Wait until the transport terminates (EOF or fatal read error).
    pub async fn closed(&self) {
        self.inner.done.cancelled().await;
    }

    /// Close the write half, signalling EOF to the subprocess.
    pub async fn close(&self) {
        let mut writer = self.inner.writer.lock().await;
        *writer = None;
    }

    /// Send a request and wait for its response, cancellation, or transport
    /// termination, whichever comes first.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, RpcClientError> {
        if self.inner.done.is_cancelled() {
            return Err(RpcClientError::ClientClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let req = Request {
            id,
            method: method.to_string(),
            params,
        };
        let line = match serde_json::to_string(&req) {
            Ok(line) => line,
            Err(err) => {
                self.remove_pending(id).await;
                return Err(err.into());
            }
        };

        if let Err(err) = self.write_line(&line).await {
            self.remove_pending(id).await;
            return Err(err);
        }

        tokio::select! {
            result = rx => match result {
                Ok(SlotResult::Ok(value)) => Ok(value),
                Ok(SlotResult::Rpc(err)) => Err(RpcClientError::Rpc {
                    code: err.code,
                    message: err.message,
                }),
                Ok(SlotResult::Closed) | Err(_) => Err(RpcClientError::ClientClosed),
            },
            _ = cancel.cancelled() => {
                self.remove_pending(id).await;
                Err(RpcClientError::Cancelled)
            }
            _ = self.inner.done.cancelled() => {
                self.remove_pending(id).await;
                Err(RpcClientError::ClientClosed)
            }
        }
    }

    /// Send a notification. Returns as soon as the line has been written.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), RpcClientError> {
        let notif = Notification {
            method: method.to_string(),
            params,
        };
        let line = serde_json::to_string(&notif)?;
        self.write_line(&line).await
    }

    async fn remove_pending(&self, id: i64) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    async fn write_line(&self, line: &str) -> Result<(), RpcClientError> {
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(RpcClientError::ClientClosed)?;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn read_loop(inner: Arc<ClientInner>, reader: Box<dyn AsyncRead + Send + Unpin>) {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    debug!("agent subprocess closed its stdout");
                    break;
                }
                Ok(_) => {
                    if !line.trim().is_empty() {
                        Self::dispatch(&inner, &line).await;
                    }
                }
                Err(err) => {
                    warn!("error reading from agent subprocess: {err}");
                    break;
                }
            }
        }

        // Drain every outstanding slot before marking the transport done.
        {
            let mut pending = inner.pending.lock().await;
            for (_, tx) in pending.drain() {
                let _ = tx.send(SlotResult::Closed);
            }
        }
        inner.done.cancel();
    }

    /// Route a single incoming line based on which fields are present.
    async fn dispatch(inner: &Arc<ClientInner>, line: &str) {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(err) => {
                trace!("skipping undecodable line from agent: {err}");
                return;
            }
        };
        let Some(obj) = value.as_object() else {
            return;
        };

        let has_id = obj.contains_key("id");
        let has_method = obj.contains_key("method");
        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");

        if has_id && has_result {
            if let Ok(resp) = serde_json::from_value::<Response>(value) {
                if let Some(id) = resp.id.as_i64() {
                    Self::resolve(inner, id, SlotResult::Ok(resp.result)).await;
                }
            }
        } else if has_id && has_error {
            if let Ok(resp) = serde_json::from_value::<ErrorResponse>(value) {
                if let Some(id) = resp.id.as_i64() {
                    Self::resolve(inner, id, SlotResult::Rpc(resp.error)).await;
                }
            }
        } else if has_id && has_method {
            // Server-initiated request. Handled off the read loop so a slow
            // handler cannot stall response delivery.
            let id = obj.get("id").cloned().unwrap_or(Value::Null);
            let method = obj
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = obj.get("params").cloned().unwrap_or(Value::Null);
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                Self::handle_server_request(inner, id, method, params).await;
            });
        } else if has_method {
            let method = obj
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let params = obj.get("params").cloned().unwrap_or(Value::Null);
            let handler = { inner.notify_handler.lock().await.clone() };
            if let Some(handler) = handler {
                handler(&method, params);
            }
        }
    }

    async fn resolve(inner: &Arc<ClientInner>, id: i64, result: SlotResult) {
        let tx = {
            let mut pending = inner.pending.lock().await;
            pending.remove(&id)
        };
        if let Some(tx) = tx {
            // The caller may have cancelled already; the result is dropped.
            let _ = tx.send(result);
        }
    }

    async fn handle_server_request(
        inner: Arc<ClientInner>,
        id: Value,
        method: String,
        params: Value,
    ) {
        let handler = { inner.request_handler.lock().await.clone() };
        let outcome = match handler {
            Some(handler) => handler(&method, params),
            None => Err(RpcError::new(
                super::protocol::CODE_METHOD_NOT_FOUND,
                "no handler registered",
            )),
        };

        let line = match outcome {
            Ok(result) => serde_json::to_string(&Response { id, result }),
            Err(error) => serde_json::to_string(&ErrorResponse { id, error }),
        };
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                warn!("failed to encode server-request reply: {err}");
                return;
            }
        };

        let mut guard = inner.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            if writer.write_all(line.as_bytes()).await.is_ok()
                && writer.write_all(b"\n").await.is_ok()
            {
                let _ = writer.flush().await;
            }
        }
    }
}

// ============================================================================
// Typed API wrappers
// ============================================================================

impl RpcClient {
    /// Perform the handshake: send the `initialize` request, then the
    /// `initialized` notification.
    pub async fn initialize(
        &self,
        cancel: &CancellationToken,
    ) -> Result<InitializeResponse, RpcClientError> {
        let params = InitializeParams {
            client_info: super::protocol::ClientInfo {
                name: "codecrew".to_string(),
                version: VERSION.to_string(),
            },
        };
        let raw = self
            .call(METHOD_INITIALIZE, Some(serde_json::to_value(&params)?), cancel)
            .await?;
        let resp: InitializeResponse = serde_json::from_value(raw)?;
        self.notify(METHOD_INITIALIZED, None).await?;
        Ok(resp)
    }

    /// Create a new conversation thread.
    pub async fn thread_start(
        &self,
        params: ThreadStartParams,
        cancel: &CancellationToken,
    ) -> Result<ThreadStartResponse, RpcClientError> {
        let raw = self
            .call(
                METHOD_THREAD_START,
                Some(serde_json::to_value(&params)?),
                cancel,
            )
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Send user input and begin a new turn.
    pub async fn turn_start(
        &self,
        params: TurnStartParams,
        cancel: &CancellationToken,
    ) -> Result<TurnStartResponse, RpcClientError> {
        let raw = self
            .call(
                METHOD_TURN_START,
                Some(serde_json::to_value(&params)?),
                cancel,
            )
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Stop the current turn.
    pub async fn turn_interrupt(
        &self,
        params: TurnInterruptParams,
        cancel: &CancellationToken,
    ) -> Result<(), RpcClientError> {
        self.call(
            METHOD_TURN_INTERRUPT,
            Some(serde_json::to_value(&params)?),
            cancel,
        )
        .await?;
        Ok(())
    }
}

/// Build the server-request handler that grants every approval.
///
/// `command/approval` and `fileChange/approval` both receive
/// `{"decision":"accept"}`; any other server method is answered with a
/// method-not-found error.
pub fn auto_approve_handler() -> ServerRequestHandler {
    Arc::new(|method, _params| match method {
        REQUEST_COMMAND_APPROVAL | REQUEST_FILE_CHANGE_APPROVAL => {
            let resp = ApprovalResponse {
                decision: ApprovalDecision::Accept,
            };
            serde_json::to_value(&resp).map_err(|e| RpcError::new(-1, e.to_string()))
        }
        other => Err(RpcError::method_not_found(other)),
    })
}
