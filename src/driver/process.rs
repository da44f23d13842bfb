//! Driver helper process client
//!
//! Spawns the configured driver helper and talks to it over stdio. A reader
//! task routes each response to the request waiting for it by sequence
//! number, so a screenshot requested by the capture subsystem never queues
//! behind a slow step action.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::codec;
use super::{Driver, DriverConnector, DriverError, ElementSnapshot};
use crate::common::config::DriverConfig;
use crate::provision::EnvironmentHandle;
use crate::scenario::{ActionInstruction, Target, WaitState};

type Pending = Arc<StdMutex<HashMap<i64, oneshot::Sender<ResponseMessage>>>>;

/// Response from the driver helper
#[derive(Debug, Deserialize)]
struct ResponseMessage {
    request_seq: i64,
    success: bool,
    #[serde(default)]
    transient: bool,
    message: Option<String>,
    body: Option<Value>,
}

/// Removes a pending entry if the request future is dropped (step timeout)
struct PendingGuard {
    pending: Pending,
    seq: i64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.seq);
        }
    }
}

/// Client for a driver helper process
pub struct ProcessDriver {
    /// Helper subprocess
    child: Mutex<Option<Child>>,
    /// Buffered writer for helper stdin
    writer: Mutex<BufWriter<ChildStdin>>,
    /// Requests waiting for a response
    pending: Pending,
    /// Sequence number for requests
    seq: AtomicI64,
    /// Routes responses from helper stdout
    reader_task: JoinHandle<()>,
}

impl ProcessDriver {
    /// Spawn the driver helper for an environment and complete the handshake
    #[tracing::instrument(skip_all, fields(env = %env.id))]
    pub async fn spawn(config: &DriverConfig, env: &EnvironmentHandle) -> Result<Self, DriverError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .env("UXTEST_PROFILE_DIR", &env.profile_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(port) = env.debug_port {
            cmd.env("UXTEST_CDP_PORT", port.to_string());
        }
        if let Some(workspace) = &env.workspace {
            cmd.env("UXTEST_WORKSPACE", workspace);
        }

        tracing::debug!(command = %config.command.display(), "Spawning driver helper");
        let mut child = cmd.spawn().map_err(|e| {
            DriverError::Spawn(format!("{}: {}", config.command.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Spawn("Failed to get driver stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Spawn("Failed to get driver stdout".to_string()))?;

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let reader_task = tokio::spawn(route_responses(BufReader::new(stdout), pending.clone()));

        let driver = Self {
            child: Mutex::new(Some(child)),
            writer: Mutex::new(BufWriter::new(stdin)),
            pending,
            seq: AtomicI64::new(1),
            reader_task,
        };

        let handshake = driver.request(
            "initialize",
            json!({
                "cdpPort": env.debug_port,
                "channel": env.channel.as_str(),
            }),
        );
        match tokio::time::timeout(Duration::from_secs(config.connect_timeout_secs), handshake).await
        {
            Ok(Ok(_)) => Ok(driver),
            Ok(Err(e)) => {
                driver.close().await;
                Err(e)
            }
            Err(_) => {
                driver.close().await;
                Err(DriverError::Spawn(format!(
                    "driver did not answer initialize within {}s",
                    config.connect_timeout_secs
                )))
            }
        }
    }

    /// Send a request and wait for its response body
    async fn request(&self, command: &str, arguments: Value) -> Result<Value, DriverError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| DriverError::Protocol("pending table poisoned".to_string()))?
            .insert(seq, tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            seq,
        };

        let message = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        tracing::trace!("driver >>> {}", message);

        {
            let mut writer = self.writer.lock().await;
            codec::write_message(&mut *writer, &message).await?;
        }

        let response = rx.await.map_err(|_| DriverError::Disconnected)?;
        if response.success {
            Ok(response.body.unwrap_or(Value::Null))
        } else {
            let message = response
                .message
                .unwrap_or_else(|| format!("{} failed", command));
            if response.transient {
                Err(DriverError::Transient(message))
            } else {
                Err(DriverError::Failed(message))
            }
        }
    }
}

/// Read responses until the helper exits, completing pending requests
async fn route_responses(mut reader: BufReader<ChildStdout>, pending: Pending) {
    loop {
        let msg = match codec::read_message(&mut reader).await {
            Ok(msg) => msg,
            Err(DriverError::Protocol(e)) => {
                tracing::warn!("Unreadable driver message: {}", e);
                continue;
            }
            Err(e) => {
                tracing::debug!("Driver stream closed: {}", e);
                break;
            }
        };
        tracing::trace!("driver <<< {}", msg);

        match msg.get("type").and_then(|v| v.as_str()).unwrap_or("unknown") {
            "response" => match serde_json::from_value::<ResponseMessage>(msg) {
                Ok(response) => {
                    let waiter = pending
                        .lock()
                        .ok()
                        .and_then(|mut p| p.remove(&response.request_seq));
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => tracing::debug!(
                            seq = response.request_seq,
                            "Response for abandoned request"
                        ),
                    }
                }
                Err(e) => tracing::warn!("Malformed driver response: {}", e),
            },
            "event" => {
                let event = msg.get("event").and_then(|v| v.as_str()).unwrap_or("?");
                tracing::debug!(event, body = %msg.get("body").unwrap_or(&serde_json::Value::Null), "Driver event");
            }
            other => tracing::warn!("Unknown driver message type: {}", other),
        }
    }

    // Dropping the senders wakes every waiter with Disconnected
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
}

fn action_arguments(action: &ActionInstruction, target: Option<&Target>) -> Value {
    let mut args = json!({ "action": action.verb() });
    if let Some(target) = target {
        args["target"] = json!({ target.field(): target.value() });
    }
    match action {
        ActionInstruction::Type { text } => args["text"] = json!(text),
        ActionInstruction::Press { key } => args["key"] = json!(key),
        ActionInstruction::RunCommand { command } => args["command"] = json!(command),
        ActionInstruction::OpenFile { path } => args["path"] = json!(path),
        ActionInstruction::Click
        | ActionInstruction::DoubleClick
        | ActionInstruction::Hover
        | ActionInstruction::Focus => {}
    }
    args
}

#[async_trait]
impl Driver for ProcessDriver {
    async fn perform(
        &self,
        action: &ActionInstruction,
        target: Option<&Target>,
    ) -> Result<(), DriverError> {
        self.request("perform", action_arguments(action, target))
            .await
            .map(|_| ())
    }

    async fn wait_for(
        &self,
        target: &Target,
        state: WaitState,
        timeout: Duration,
    ) -> Result<(), DriverError> {
        self.request(
            "waitFor",
            json!({
                "target": { target.field(): target.value() },
                "state": state.as_str(),
                "timeoutMs": timeout.as_millis() as u64,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn inspect(&self, target: &Target) -> Result<ElementSnapshot, DriverError> {
        let body = self
            .request("inspect", json!({ "target": { target.field(): target.value() } }))
            .await?;
        serde_json::from_value(body)
            .map_err(|e| DriverError::Protocol(format!("Failed to parse inspect response: {}", e)))
    }

    async fn screenshot(&self, method: &str) -> Result<Vec<u8>, DriverError> {
        let body = self.request("screenshot", json!({ "method": method })).await?;
        let data = body
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DriverError::Protocol("screenshot response has no data".to_string()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| DriverError::Protocol(format!("Invalid screenshot encoding: {}", e)))
    }

    async fn close(&self) {
        let shutdown = self.request("shutdown", json!({}));
        if tokio::time::timeout(Duration::from_secs(2), shutdown).await.is_err() {
            tracing::debug!("Driver did not acknowledge shutdown");
        }

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    let _ = child.kill().await;
                }
            }
        }
        self.reader_task.abort();
    }
}

/// Connects a `ProcessDriver` to each provisioned environment
pub struct ProcessDriverConnector {
    config: DriverConfig,
}

impl ProcessDriverConnector {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DriverConnector for ProcessDriverConnector {
    async fn connect(&self, env: &EnvironmentHandle) -> Result<Arc<dyn Driver>, DriverError> {
        let driver = ProcessDriver::spawn(&self.config, env).await?;
        Ok(Arc::new(driver))
    }
}
