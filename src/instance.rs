//! One worker process plus the host-side connection to it.
//!
//! An instance exclusively owns its child process, its framed connection and
//! its endpoint address, and is responsible for releasing all three on stop.
//! Startup is atomic from the caller's perspective: either the instance
//! reaches `Ready` (running + connected, function list recorded) or every
//! acquired resource is released.
//!
//! Locking: instance status lives under a readers-writer lock; each
//! connection has its own mutex held end-to-end across one request/response
//! exchange. The status lock is never held while acquiring the connection
//! lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use crate::config::PluginConfig;
use crate::error::{HostError, Result};
use crate::framing::FramedConnection;
use crate::message::{Message, MessageType};
use crate::transport::Transport;

/// Environment variable carrying the endpoint address to the worker.
pub const ADDRESS_ENV_VAR: &str = "GOPROC_PLUGIN_ADDRESS";

/// Ceiling on one request/response exchange.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);

const PROCESS_READY_TIMEOUT: Duration = Duration::from_millis(500);
const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(10);
const PROCESS_MIN_UPTIME: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
const REGISTER_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_GRACE_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

struct InstanceState {
    child: Option<Child>,
    connection: Option<Arc<FramedConnection>>,
    running: bool,
    connected: bool,
    functions: Vec<String>,
    last_used: DateTime<Utc>,
}

/// Point-in-time view of one instance, for status aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub id: String,
    pub plugin_name: String,
    pub running: bool,
    pub connected: bool,
    pub functions: Vec<String>,
    pub last_used: String,
    pub address: String,
}

pub struct PluginInstance {
    id: String,
    plugin_name: String,
    config: PluginConfig,
    address: String,
    transport: Arc<dyn Transport>,
    state: RwLock<InstanceState>,
    /// Exclusive use of the connection for one send + receive exchange.
    conn_lock: Mutex<()>,
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginInstance")
            .field("id", &self.id)
            .field("plugin_name", &self.plugin_name)
            .field("address", &self.address)
            .finish()
    }
}

impl PluginInstance {
    pub fn new(
        plugin_name: &str,
        config: PluginConfig,
        instance_id: String,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let address = transport.mint_address(plugin_name, &instance_id);
        Self {
            id: instance_id,
            plugin_name: plugin_name.to_string(),
            config,
            address,
            transport,
            state: RwLock::new(InstanceState {
                child: None,
                connection: None,
                running: false,
                connected: false,
                functions: Vec::new(),
                last_used: Utc::now(),
            }),
            conn_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin_name(&self) -> &str {
        &self.plugin_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Spawn the worker, rendezvous with it and complete the registration
    /// handshake. On any failure the child is killed and the endpoint
    /// cleaned up before the error is returned.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.running {
            return Err(HostError::AlreadyRunning(format!("instance {}", self.id)));
        }

        let mut child = self.spawn_process()?;

        if let Err(e) = wait_for_process_ready(&mut child).await {
            let _ = child.start_kill();
            let _ = self.transport.cleanup(&self.address);
            return Err(e);
        }

        let connection = match self.connect_with_retry().await {
            Ok(connection) => connection,
            Err(e) => {
                let _ = child.start_kill();
                let _ = self.transport.cleanup(&self.address);
                return Err(e);
            }
        };

        state.child = Some(child);
        state.connection = Some(connection.clone());
        // Release the status lock for the registration wait; calls arriving
        // in this window still see connected == false and bounce.
        drop(state);

        let functions = match self.wait_for_registration(&connection).await {
            Ok(functions) => functions,
            Err(e) => {
                connection.close().await;
                let mut state = self.state.write().await;
                if let Some(child) = state.child.as_mut() {
                    let _ = child.start_kill();
                }
                state.child = None;
                state.connection = None;
                let _ = self.transport.cleanup(&self.address);
                return Err(e);
            }
        };

        tracing::debug!(
            instance = %self.id,
            plugin = %self.plugin_name,
            functions = ?functions,
            "worker registered"
        );

        let mut state = self.state.write().await;
        state.functions = functions;
        state.running = true;
        state.connected = true;
        Ok(())
    }

    fn spawn_process(&self) -> Result<Child> {
        let (program, mut args) = self.config.command();
        // The endpoint address is always the trailing argument.
        args.push(self.address.clone());

        let mut cmd = Command::new(&program);
        // Config env first: the injected address must never be shadowed.
        cmd.args(&args)
            .envs(&self.config.env)
            .env(ADDRESS_ENV_VAR, &self.address)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        if let Some(dir) = Path::new(&program).parent() {
            if !dir.as_os_str().is_empty() {
                cmd.current_dir(dir);
            }
        }

        cmd.spawn().map_err(|e| {
            HostError::StartFailed(format!("failed to spawn worker '{program}': {e}"))
        })
    }

    async fn connect_with_retry(&self) -> Result<Arc<FramedConnection>> {
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            match self.transport.dial(&self.address).await {
                Ok(stream) => return Ok(Arc::new(FramedConnection::new(stream))),
                Err(e) => {
                    if Instant::now() + CONNECT_RETRY_DELAY >= deadline {
                        return Err(HostError::StartFailed(format!(
                            "could not connect to worker at {}: {e}",
                            self.address
                        )));
                    }
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }

    /// Read frames until the worker's `register` arrives, then acknowledge
    /// it. Non-register frames are silently discarded, malformed frames
    /// skipped. Short read timeouts keep the loop responsive to the overall
    /// deadline.
    async fn wait_for_registration(&self, connection: &FramedConnection) -> Result<Vec<String>> {
        let deadline = Instant::now() + REGISTER_TIMEOUT;
        loop {
            if Instant::now() >= deadline {
                return Err(HostError::StartFailed(format!(
                    "timed out waiting for registration from instance {}",
                    self.id
                )));
            }

            let frame = match timeout(REGISTER_POLL_TIMEOUT, connection.recv_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(e)) => return Err(e),
                Err(_) => continue,
            };

            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(_) => continue,
            };
            if message.kind != MessageType::Register {
                continue;
            }
            let Some(functions) = message.registered_functions() else {
                continue;
            };

            connection.send_message(&Message::register_ack()).await?;
            return Ok(functions);
        }
    }

    /// Invoke one registered function and wait for its response.
    ///
    /// The connection lock is held across send + receive, so responses on
    /// one instance come back in the order their requests were sent. The
    /// receive loop tolerates stale frames left by a previous caller that
    /// timed out, and answers interleaved heartbeats.
    pub async fn call(&self, function: &str, params: Map<String, Value>) -> Result<Value> {
        let connection = {
            let state = self.state.read().await;
            if !state.connected {
                return Err(HostError::NotConnected(self.id.clone()));
            }
            if !state.functions.iter().any(|f| f == function) {
                return Err(HostError::UnknownFunction {
                    plugin: self.plugin_name.clone(),
                    function: function.to_string(),
                });
            }
            match &state.connection {
                Some(connection) => connection.clone(),
                None => return Err(HostError::NotConnected(self.id.clone())),
            }
        };

        let _guard = self.conn_lock.lock().await;

        let message_id = correlation_id("call");
        let data = Message::call(message_id.clone(), function.to_string(), params).encode()?;
        if connection.send_frame(&data).await.is_err() {
            self.mark_disconnected().await;
            return Err(HostError::ConnectionLost);
        }

        let deadline = Instant::now() + CALL_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(HostError::CallTimeout);
            }

            let frame = match timeout(remaining, connection.recv_frame()).await {
                Ok(Ok(frame)) => frame,
                Ok(Err(_)) => {
                    self.mark_disconnected().await;
                    return Err(HostError::ConnectionLost);
                }
                Err(_) => return Err(HostError::CallTimeout),
            };

            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(_) => continue,
            };

            if message.id.as_deref() == Some(message_id.as_str()) {
                return match message.kind {
                    MessageType::Result => {
                        self.touch_last_used().await;
                        Ok(message.result.unwrap_or(Value::Null))
                    }
                    MessageType::Error => {
                        Err(HostError::Plugin(message.error.unwrap_or_default()))
                    }
                    other => Err(HostError::Protocol(format!(
                        "unexpected {other:?} response to call {message_id}"
                    ))),
                };
            }

            if message.kind == MessageType::Ping {
                let pong = Message::pong(message.id.clone());
                if connection.send_message(&pong).await.is_err() {
                    self.mark_disconnected().await;
                    return Err(HostError::ConnectionLost);
                }
                continue;
            }
            // Stale frame from an abandoned exchange; keep looping.
        }
    }

    /// Ping the worker and wait for the matching pong. Policy on an
    /// unhealthy instance belongs to the pool.
    pub async fn health_check(&self) -> bool {
        let connection = {
            let state = self.state.read().await;
            if !state.connected {
                return false;
            }
            match &state.connection {
                Some(connection) => connection.clone(),
                None => return false,
            }
        };

        let _guard = self.conn_lock.lock().await;

        let ping_id = correlation_id("healthcheck");
        if connection
            .send_message(&Message::ping(ping_id.clone()))
            .await
            .is_err()
        {
            return false;
        }

        let deadline = Instant::now() + HEALTH_CHECK_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let frame = match timeout(remaining, connection.recv_frame()).await {
                Ok(Ok(frame)) => frame,
                _ => return false,
            };
            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(_) => continue,
            };
            match message.kind {
                MessageType::Pong if message.id.as_deref() == Some(ping_id.as_str()) => {
                    return true;
                }
                MessageType::Ping => {
                    let pong = Message::pong(message.id.clone());
                    if connection.send_message(&pong).await.is_err() {
                        return false;
                    }
                }
                _ => {}
            }
        }
    }

    /// Stop the worker: graceful (`stop` frame, 2 s) then forced (close the
    /// connection, kill, 5 s reap). Idempotent and safe under concurrent
    /// call attempts; the endpoint is always cleaned up.
    pub async fn stop(&self) -> Result<()> {
        let (mut child, connection) = {
            let mut state = self.state.write().await;
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.connected = false;
            (state.child.take(), state.connection.take())
        };

        let graceful = match (&connection, child.as_mut()) {
            (Some(connection), Some(child)) => {
                let stop = Message::stop(correlation_id("stop"));
                let _ = connection.send_message(&stop).await;
                timeout(STOP_GRACE_TIMEOUT, child.wait()).await.is_ok()
            }
            _ => false,
        };

        if !graceful {
            if let Some(connection) = &connection {
                connection.close().await;
            }
            if let Some(child) = child.as_mut() {
                let _ = child.start_kill();
                if timeout(KILL_REAP_TIMEOUT, child.wait()).await.is_err() {
                    tracing::warn!(
                        instance = %self.id,
                        "worker still not reaped after kill"
                    );
                }
            }
        }

        if let Err(e) = self.transport.cleanup(&self.address) {
            tracing::warn!(instance = %self.id, error = %e, "endpoint cleanup failed");
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.state.read().await.running
    }

    pub async fn status(&self) -> InstanceStatus {
        let state = self.state.read().await;
        InstanceStatus {
            id: self.id.clone(),
            plugin_name: self.plugin_name.clone(),
            running: state.running,
            connected: state.connected,
            functions: state.functions.clone(),
            last_used: state.last_used.to_rfc3339(),
            address: self.address.clone(),
        }
    }

    async fn mark_disconnected(&self) {
        self.state.write().await.connected = false;
    }

    async fn touch_last_used(&self) {
        self.state.write().await.last_used = Utc::now();
    }

    #[cfg(test)]
    pub(crate) async fn attach_for_test(&self, connection: Arc<FramedConnection>, functions: Vec<String>) {
        let mut state = self.state.write().await;
        state.connection = Some(connection);
        state.functions = functions;
        state.running = true;
        state.connected = true;
    }
}

async fn wait_for_process_ready(child: &mut Child) -> Result<()> {
    let started = Instant::now();
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| HostError::StartFailed(format!("could not poll worker: {e}")))?
        {
            return Err(HostError::StartFailed(format!(
                "worker exited during startup: {status}"
            )));
        }
        if started.elapsed() >= PROCESS_MIN_UPTIME {
            return Ok(());
        }
        if started.elapsed() >= PROCESS_READY_TIMEOUT {
            return Err(HostError::StartFailed(
                "timed out waiting for the worker process".into(),
            ));
        }
        tokio::time::sleep(PROCESS_POLL_INTERVAL).await;
    }
}

fn correlation_id(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{prefix}-{nanos}")
}
