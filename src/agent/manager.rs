// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent process manager.
//!
//! Owns the collection of running agent subprocesses keyed by agent ID.
//! Spawning drives the full handshake (process start, `initialize`,
//! `thread/start`, handler installation); any step failing tears down
//! everything allocated earlier. Turn completion is delivered through a
//! 1-capacity channel per instance, written only by the `turn/completed`
//! notification, so waiting cannot observe spurious wake-ups.
//!
//! Per-instance state lives under the instance's own lock, never the
//! registry lock; a notification arriving while `wait_for_completion` runs
//! can therefore never invert lock order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{AgentConfig, AgentEvent, AgentState};
use super::AgentRuntime;
use crate::error::AgentError;
use crate::rpc::client::RpcClientError;
use crate::rpc::protocol::{
    AgentMessageDelta, ThreadStartParams, TurnNotification, TurnStartParams, TurnStatus,
    NOTIFY_AGENT_MESSAGE_DELTA, NOTIFY_TURN_COMPLETED, NOTIFY_TURN_STARTED,
};
use crate::rpc::{auto_approve_handler, AppServerProcess, InputItem, RpcClient, SpawnOptions};

/// Capacity of the manager's fan-out event channel.
const EVENT_CAPACITY: usize = 256;

/// A running agent instance.
pub struct AgentInstance {
    pub config: AgentConfig,
    pub thread_id: String,
    client: RpcClient,
    process: Mutex<Option<AppServerProcess>>,
    state: Mutex<AgentState>,
    completion_tx: mpsc::Sender<Result<(), AgentError>>,
    completion_rx: Mutex<mpsc::Receiver<Result<(), AgentError>>>,
    output: Mutex<String>,
}

impl AgentInstance {
    fn new(
        config: AgentConfig,
        thread_id: String,
        client: RpcClient,
        process: Option<AppServerProcess>,
    ) -> Arc<Self> {
        let (completion_tx, completion_rx) = mpsc::channel(1);
        Arc::new(Self {
            config,
            thread_id,
            client,
            process: Mutex::new(process),
            state: Mutex::new(AgentState::Idle),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
            output: Mutex::new(String::new()),
        })
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> AgentState {
        *self.state.lock().await
    }

    async fn set_state(&self, state: AgentState) {
        let mut guard = self.state.lock().await;
        *guard = state;
    }

    async fn append_output(&self, delta: &str) {
        let mut output = self.output.lock().await;
        output.push_str(delta);
    }

    /// Accumulated agent message text.
    pub async fn output(&self) -> String {
        self.output.lock().await.clone()
    }
}

/// Manages multiple agent subprocess instances.
pub struct AgentManager {
    agents: RwLock<HashMap<String, Arc<AgentInstance>>>,
    agent_bin: PathBuf,
    events: broadcast::Sender<AgentEvent>,
}

impl AgentManager {
    /// Create a manager that spawns the given agent binary.
    pub fn new(agent_bin: impl AsRef<Path>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            agents: RwLock::new(HashMap::new()),
            agent_bin: agent_bin.as_ref().to_path_buf(),
            events,
        }
    }

    /// Subscribe to the fan-out event stream: `spawned`/`stopped` markers plus
    /// every notification forwarded from the subprocesses.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Look up a running instance.
    pub async fn get(&self, agent_id: &str) -> Result<Arc<AgentInstance>, AgentError> {
        let agents = self.agents.read().await;
        agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))
    }

    /// IDs of all running instances.
    pub async fn agent_ids(&self) -> Vec<String> {
        let agents = self.agents.read().await;
        agents.keys().cloned().collect()
    }

    /// Spawn and initialise a new agent instance.
    pub async fn spawn(
        &self,
        config: AgentConfig,
        cancel: &CancellationToken,
    ) -> Result<Arc<AgentInstance>, AgentError> {
        {
            let agents = self.agents.read().await;
            if agents.contains_key(&config.id) {
                return Err(AgentError::AlreadyExists(config.id.clone()));
            }
        }

        let sandbox = config.resolved_sandbox();

        let mut process = AppServerProcess::spawn(SpawnOptions::new(&self.agent_bin))
            .map_err(|e| AgentError::SpawnFailed(e.to_string()))?;
        let client = process.client();

        if let Err(err) = client.initialize(cancel).await {
            Self::teardown(&mut process, "initialize").await;
            return Err(err.into());
        }

        let thread = match client
            .thread_start(
                ThreadStartParams {
                    cwd: Some(config.cwd.to_string_lossy().to_string()),
                    sandbox: Some(sandbox),
                    base_instructions: config.base_instructions.clone(),
                    developer_instructions: config.developer_instructions.clone(),
                },
                cancel,
            )
            .await
        {
            Ok(resp) => resp.thread,
            Err(err) => {
                Self::teardown(&mut process, "thread/start").await;
                return Err(err.into());
            }
        };

        let agent_id = config.id.clone();
        let instance = AgentInstance::new(config, thread.id, client.clone(), Some(process));

        client.set_server_request_handler(auto_approve_handler()).await;

        // Notifications are forwarded through a channel and consumed by a
        // router task, keeping the transport's read loop non-blocking.
        let (note_tx, note_rx) = mpsc::unbounded_channel::<(String, Value)>();
        client
            .set_notification_handler(Arc::new(move |method, params| {
                let _ = note_tx.send((method.to_string(), params));
            }))
            .await;
        tokio::spawn(Self::route_notifications(
            Arc::clone(&instance),
            self.events.clone(),
            note_rx,
        ));

        // If the transport dies mid-turn there will be no turn/completed;
        // fail the instance so waiters unblock.
        {
            let instance = Arc::clone(&instance);
            let client = client.clone();
            tokio::spawn(async move {
                client.closed().await;
                if instance.state().await == AgentState::Running {
                    instance.set_state(AgentState::Failed).await;
                    let _ = instance
                        .completion_tx
                        .try_send(Err(AgentError::Rpc(RpcClientError::ClientClosed)));
                }
            });
        }

        {
            let mut agents = self.agents.write().await;
            if agents.contains_key(&agent_id) {
                drop(agents);
                let mut process = instance.process.lock().await;
                if let Some(mut p) = process.take() {
                    Self::teardown(&mut p, "register").await;
                }
                return Err(AgentError::AlreadyExists(agent_id));
            }
            agents.insert(agent_id.clone(), Arc::clone(&instance));
        }

        info!(agent = %agent_id, "spawned agent");
        let _ = self
            .events
            .send(AgentEvent::new(agent_id.as_str(), "spawned", Value::Null));

        Ok(instance)
    }

    async fn teardown(process: &mut AppServerProcess, step: &str) {
        let stderr = process.stderr().await;
        if !stderr.is_empty() {
            warn!("agent subprocess stderr after failed {step}: {stderr}");
        }
        if let Err(err) = process.close().await {
            warn!("failed to close agent subprocess after failed {step}: {err}");
        }
    }

    async fn route_notifications(
        instance: Arc<AgentInstance>,
        events: broadcast::Sender<AgentEvent>,
        mut rx: mpsc::UnboundedReceiver<(String, Value)>,
    ) {
        while let Some((method, params)) = rx.recv().await {
            match method.as_str() {
                NOTIFY_TURN_STARTED => {
                    instance.set_state(AgentState::Running).await;
                }
                NOTIFY_TURN_COMPLETED => {
                    if let Ok(notif) =
                        serde_json::from_value::<TurnNotification>(params.clone())
                    {
                        match notif.turn.status {
                            TurnStatus::Completed => {
                                instance.set_state(AgentState::Completed).await;
                                let _ = instance.completion_tx.try_send(Ok(()));
                            }
                            TurnStatus::Failed => {
                                let message = notif
                                    .turn
                                    .error
                                    .map(|e| e.message)
                                    .unwrap_or_else(|| "turn failed".to_string());
                                instance.set_state(AgentState::Failed).await;
                                let _ = instance
                                    .completion_tx
                                    .try_send(Err(AgentError::TurnFailed(message)));
                            }
                            TurnStatus::Interrupted | TurnStatus::InProgress => {}
                        }
                    }
                }
                NOTIFY_AGENT_MESSAGE_DELTA => {
                    if let Ok(delta) =
                        serde_json::from_value::<AgentMessageDelta>(params.clone())
                    {
                        instance.append_output(&delta.delta).await;
                    }
                }
                _ => {}
            }

            let _ = events.send(AgentEvent::new(instance.config.id.as_str(), method.as_str(), params));
        }
        debug!(agent = %instance.config.id, "notification router stopped");
    }
}

#[async_trait]
impl AgentRuntime for AgentManager {
    async fn spawn_agent(
        &self,
        config: AgentConfig,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        self.spawn(config, cancel).await.map(|_| ())
    }

    async fn send_task(
        &self,
        agent_id: &str,
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let instance = self.get(agent_id).await?;
        instance.set_state(AgentState::Running).await;

        let result = instance
            .client
            .turn_start(
                TurnStartParams {
                    thread_id: instance.thread_id.clone(),
                    input: vec![InputItem::text(message)],
                },
                cancel,
            )
            .await;

        if let Err(err) = result {
            instance.set_state(AgentState::Failed).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn wait_for_completion(
        &self,
        agent_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let instance = self.get(agent_id).await?;
        let mut rx = instance.completion_rx.lock().await;
        tokio::select! {
            result = rx.recv() => match result {
                Some(outcome) => outcome,
                None => Err(AgentError::TurnFailed(
                    "agent terminated before completing".to_string(),
                )),
            },
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
        }
    }

    async fn stop_agent(&self, agent_id: &str) -> Result<(), AgentError> {
        let instance = {
            let mut agents = self.agents.write().await;
            agents
                .remove(agent_id)
                .ok_or_else(|| AgentError::NotFound(agent_id.to_string()))?
        };

        let mut process = instance.process.lock().await;
        if let Some(mut p) = process.take() {
            if let Err(err) = p.close().await {
                warn!(agent = %agent_id, "agent subprocess did not exit cleanly: {err}");
            }
        }

        info!(agent = %agent_id, "stopped agent");
        let _ = self
            .events
            .send(AgentEvent::new(agent_id, "stopped", Value::Null));
        Ok(())
    }

    async fn output(&self, agent_id: &str) -> String {
        match self.get(agent_id).await {
            Ok(instance) => instance.output().await,
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::types::AgentRole;
    use serde_json::json;
    use std::time::Duration;

    fn test_instance() -> (Arc<AgentInstance>, RpcClient) {
        let (client_side, _server_side) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_side);
        let client = RpcClient::new(write_half, read_half);
        let config = AgentConfig::new("agent-t", AgentRole::Worker, "/tmp/wt");
        let instance = AgentInstance::new(config, "thread-1".to_string(), client.clone(), None);
        (instance, client)
    }

    #[tokio::test]
    async fn test_stop_unknown_agent_is_not_found() {
        let manager = AgentManager::new("/usr/bin/agent");
        let err = manager.stop_agent("ghost").await.unwrap_err();
        assert!(matches!(err, AgentError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_output_of_unknown_agent_is_empty() {
        let manager = AgentManager::new("/usr/bin/agent");
        assert_eq!(manager.output("ghost").await, "");
    }

    #[tokio::test]
    async fn test_route_turn_started_sets_running() {
        let (instance, _client) = test_instance();
        let (events, _) = broadcast::channel(16);
        let (tx, rx) = mpsc::unbounded_channel();

        let router = tokio::spawn(AgentManager::route_notifications(
            Arc::clone(&instance),
            events,
            rx,
        ));

        tx.send((
            NOTIFY_TURN_STARTED.to_string(),
            json!({"threadId": "thread-1", "turn": {"id": "u1", "status": "inProgress"}}),
        ))
        .unwrap();
        drop(tx);
        router.await.unwrap();

        assert_eq!(instance.state().await, AgentState::Running);
    }

    #[tokio::test]
    async fn test_route_turn_completed_signals_completion() {
        let (instance, _client) = test_instance();
        let (events, _) = broadcast::channel(16);
        let (tx, rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(AgentManager::route_notifications(
            Arc::clone(&instance),
            events,
            rx,
        ));

        tx.send((
            NOTIFY_TURN_COMPLETED.to_string(),
            json!({"threadId": "thread-1", "turn": {"id": "u1", "status": "completed"}}),
        ))
        .unwrap();
        drop(tx);
        router.await.unwrap();

        assert_eq!(instance.state().await, AgentState::Completed);
        let mut rx = instance.completion_rx.lock().await;
        let outcome = rx.recv().await.unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn test_route_turn_failed_signals_error() {
        let (instance, _client) = test_instance();
        let (events, _) = broadcast::channel(16);
        let (tx, rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(AgentManager::route_notifications(
            Arc::clone(&instance),
            events,
            rx,
        ));

        tx.send((
            NOTIFY_TURN_COMPLETED.to_string(),
            json!({
                "threadId": "thread-1",
                "turn": {"id": "u1", "status": "failed", "error": {"message": "model error"}}
            }),
        ))
        .unwrap();
        drop(tx);
        router.await.unwrap();

        assert_eq!(instance.state().await, AgentState::Failed);
        let mut rx = instance.completion_rx.lock().await;
        let outcome = rx.recv().await.unwrap();
        match outcome {
            Err(AgentError::TurnFailed(msg)) => assert_eq!(msg, "model error"),
            other => panic!("expected TurnFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_route_in_progress_leaves_state_untouched() {
        let (instance, _client) = test_instance();
        let (events, _) = broadcast::channel(16);
        let (tx, rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(AgentManager::route_notifications(
            Arc::clone(&instance),
            events,
            rx,
        ));

        tx.send((
            NOTIFY_TURN_COMPLETED.to_string(),
            json!({"threadId": "thread-1", "turn": {"id": "u1", "status": "inProgress"}}),
        ))
        .unwrap();
        drop(tx);
        router.await.unwrap();

        assert_eq!(instance.state().await, AgentState::Idle);
    }

    #[tokio::test]
    async fn test_route_delta_accumulates_output() {
        let (instance, _client) = test_instance();
        let (events, _) = broadcast::channel(16);
        let (tx, rx) = mpsc::unbounded_channel();
        let router = tokio::spawn(AgentManager::route_notifications(
            Arc::clone(&instance),
            events,
            rx,
        ));

        for delta in ["{\"tasks\"", ": []}"] {
            tx.send((
                NOTIFY_AGENT_MESSAGE_DELTA.to_string(),
                json!({"threadId": "thread-1", "turnId": "u1", "itemId": "i1", "delta": delta}),
            ))
            .unwrap();
        }
        drop(tx);
        router.await.unwrap();

        assert_eq!(instance.output().await, "{\"tasks\": []}");
    }

    #[tokio::test]
    async fn test_notifications_are_forwarded_to_event_channel() {
        let (instance, _client) = test_instance();
        let (events, mut event_rx) = broadcast::channel(16);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(AgentManager::route_notifications(
            Arc::clone(&instance),
            events,
            rx,
        ));

        tx.send(("item/started".to_string(), json!({"itemId": "i1"})))
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.agent_id, "agent-t");
        assert_eq!(event.event_type, "item/started");
    }

    #[tokio::test]
    async fn test_wait_for_completion_cancellation() {
        let manager = AgentManager::new("/usr/bin/agent");
        let (instance, _client) = test_instance();
        {
            let mut agents = manager.agents.write().await;
            agents.insert(instance.config.id.clone(), Arc::clone(&instance));
        }

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = manager
            .wait_for_completion("agent-t", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[tokio::test]
    async fn test_wait_for_completion_receives_signal() {
        let manager = AgentManager::new("/usr/bin/agent");
        let (instance, _client) = test_instance();
        {
            let mut agents = manager.agents.write().await;
            agents.insert(instance.config.id.clone(), Arc::clone(&instance));
        }

        instance.completion_tx.try_send(Ok(())).unwrap();
        let cancel = CancellationToken::new();
        manager
            .wait_for_completion("agent-t", &cancel)
            .await
            .unwrap();
    }
}
