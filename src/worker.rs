//! Worker-side SDK.
//!
//! A worker process builds a [`Worker`], registers its functions and calls
//! [`Worker::serve`]. The SDK owns the wire contract: listen at the address
//! the host minted, accept exactly one connection, announce the function
//! list, wait for the host's acknowledgement, then serve calls until a
//! `stop` frame arrives.
//!
//! Handlers run concurrently on spawned tasks, so responses may be emitted
//! in any order; the connection's writer mutex keeps frames whole.

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{ConfigError, HostError, Result, TransportError};
use crate::framing::FramedConnection;
use crate::instance::ADDRESS_ENV_VAR;
use crate::message::{Message, MessageType};
use crate::transport::platform_transport;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// What a function handler returns: a JSON result, or an error message
/// relayed verbatim to the caller.
pub type HandlerResult = std::result::Result<Value, String>;

type Handler =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Default)]
pub struct Worker {
    functions: HashMap<String, Handler>,
}

impl Worker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named async function. Registration is rejected once a
    /// name is taken.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F) -> Result<&mut Self>
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.functions.contains_key(name) {
            return Err(ConfigError::Validation(format!(
                "function '{name}' is already registered"
            ))
            .into());
        }
        self.functions.insert(
            name.to_string(),
            Arc::new(move |params| Box::pin(handler(params))),
        );
        Ok(self)
    }

    /// Serve at the address the host provided via `GOPROC_PLUGIN_ADDRESS`
    /// or the first command-line argument.
    pub async fn serve(self) -> Result<()> {
        let address = resolve_address()?;
        self.serve_at(&address).await
    }

    /// Listen at `address`, accept the host's single connection, complete
    /// the registration handshake, then serve until stopped.
    pub async fn serve_at(self, address: &str) -> Result<()> {
        let transport = platform_transport(None);
        let mut listener = transport.listen(address).await?;

        let stream = timeout(ACCEPT_TIMEOUT, listener.accept())
            .await
            .map_err(|_| HostError::Transport(TransportError::AcceptTimeout))??;
        let connection = Arc::new(FramedConnection::new(stream));

        let names: Vec<String> = self.functions.keys().cloned().collect();
        connection.send_message(&Message::register(names)).await?;

        // No call is served before the host acknowledges registration.
        loop {
            let frame = connection.recv_frame().await?;
            match Message::decode(&frame) {
                Ok(message) if message.kind == MessageType::RegisterAck => break,
                _ => continue,
            }
        }

        tracing::debug!(address, functions = self.functions.len(), "worker serving");

        let functions = Arc::new(self.functions);
        loop {
            let frame = match connection.recv_frame().await {
                Ok(frame) => frame,
                // The host went away; there is no one left to serve.
                Err(HostError::Transport(TransportError::Closed)) => return Ok(()),
                Err(e) => return Err(e),
            };
            let message = match Message::decode(&frame) {
                Ok(message) => message,
                Err(_) => continue,
            };

            match message.kind {
                MessageType::Call => {
                    dispatch_call(&functions, &connection, message).await;
                }
                MessageType::Ping => {
                    let _ = connection.send_message(&Message::pong(message.id)).await;
                }
                MessageType::Stop => {
                    tracing::debug!("stop received, exiting");
                    return Ok(());
                }
                _ => {}
            }
        }
    }
}

/// Run the handler on its own task so slow calls never block the read
/// loop; the response echoes the call's correlation id.
async fn dispatch_call(
    functions: &Arc<HashMap<String, Handler>>,
    connection: &Arc<FramedConnection>,
    message: Message,
) {
    // A call without a correlation id cannot be answered.
    let Some(id) = message.id else { return };
    let function = message.function.unwrap_or_default();
    let params = message.params.unwrap_or_default();

    let Some(handler) = functions.get(&function).cloned() else {
        let error = Message::error(id, format!("function '{function}' is not registered"));
        let _ = connection.send_message(&error).await;
        return;
    };

    let connection = connection.clone();
    tokio::spawn(async move {
        let response = match handler(params).await {
            Ok(result) => Message::result(id, result),
            Err(error) => Message::error(id, error),
        };
        if let Err(e) = connection.send_message(&response).await {
            tracing::warn!(error = %e, "failed to send response");
        }
    });
}

fn resolve_address() -> Result<String> {
    if let Ok(address) = std::env::var(ADDRESS_ENV_VAR) {
        if !address.is_empty() {
            return Ok(address);
        }
    }
    if let Some(address) = std::env::args().nth(1) {
        return Ok(address);
    }
    Err(ConfigError::Validation(format!(
        "no endpoint address: set {ADDRESS_ENV_VAR} or pass it as the first argument"
    ))
    .into())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    async fn dial_with_retry(address: &str) -> Arc<FramedConnection> {
        let transport = platform_transport(None);
        for _ in 0..50 {
            if let Ok(stream) = transport.dial(address).await {
                return Arc::new(FramedConnection::new(stream));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("worker never started listening at {address}");
    }

    async fn handshake(connection: &FramedConnection) -> Vec<String> {
        let frame = connection.recv_frame().await.unwrap();
        let register = Message::decode(&frame).unwrap();
        assert_eq!(register.kind, MessageType::Register);
        let functions = register.registered_functions().unwrap();
        connection
            .send_message(&Message::register_ack())
            .await
            .unwrap();
        functions
    }

    fn test_worker() -> Worker {
        let mut worker = Worker::new();
        worker
            .register("add", |params: Map<String, Value>| async move {
                let a = params.get("a").and_then(Value::as_f64).unwrap_or(0.0);
                let b = params.get("b").and_then(Value::as_f64).unwrap_or(0.0);
                Ok(json!(a + b))
            })
            .unwrap();
        worker
            .register("slow", |_params| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("slow"))
            })
            .unwrap();
        worker
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut worker = Worker::new();
        worker.register("add", |_| async { Ok(json!(1)) }).unwrap();
        assert!(worker.register("add", |_| async { Ok(json!(2)) }).is_err());
    }

    #[tokio::test]
    async fn handshake_then_call_then_stop() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("worker.sock").to_string_lossy().into_owned();

        let serve_address = address.clone();
        let serving = tokio::spawn(async move { test_worker().serve_at(&serve_address).await });

        let connection = dial_with_retry(&address).await;
        let mut functions = handshake(&connection).await;
        functions.sort();
        assert_eq!(functions, vec!["add".to_string(), "slow".to_string()]);

        let mut params = Map::new();
        params.insert("a".into(), json!(10));
        params.insert("b".into(), json!(5));
        connection
            .send_message(&Message::call("c-1".into(), "add".into(), params))
            .await
            .unwrap();

        let frame = connection.recv_frame().await.unwrap();
        let result = Message::decode(&frame).unwrap();
        assert_eq!(result.kind, MessageType::Result);
        assert_eq!(result.id.as_deref(), Some("c-1"));
        assert_eq!(result.result, Some(json!(15.0)));

        connection
            .send_message(&Message::stop("s-1".into()))
            .await
            .unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn handlers_run_concurrently_and_respond_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("worker.sock").to_string_lossy().into_owned();

        let serve_address = address.clone();
        let serving = tokio::spawn(async move { test_worker().serve_at(&serve_address).await });

        let connection = dial_with_retry(&address).await;
        handshake(&connection).await;

        connection
            .send_message(&Message::call("c-slow".into(), "slow".into(), Map::new()))
            .await
            .unwrap();
        connection
            .send_message(&Message::call("c-fast".into(), "add".into(), Map::new()))
            .await
            .unwrap();

        // The fast call overtakes the slow one.
        let first = Message::decode(&connection.recv_frame().await.unwrap()).unwrap();
        assert_eq!(first.id.as_deref(), Some("c-fast"));
        let second = Message::decode(&connection.recv_frame().await.unwrap()).unwrap();
        assert_eq!(second.id.as_deref(), Some("c-slow"));

        connection
            .send_message(&Message::stop("s-1".into()))
            .await
            .unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_function_gets_an_error_frame() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("worker.sock").to_string_lossy().into_owned();

        let serve_address = address.clone();
        let serving = tokio::spawn(async move { test_worker().serve_at(&serve_address).await });

        let connection = dial_with_retry(&address).await;
        handshake(&connection).await;

        connection
            .send_message(&Message::call("c-2".into(), "missing".into(), Map::new()))
            .await
            .unwrap();
        let reply = Message::decode(&connection.recv_frame().await.unwrap()).unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.id.as_deref(), Some("c-2"));

        connection
            .send_message(&Message::stop("s-1".into()))
            .await
            .unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ping_is_answered_with_matching_pong() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("worker.sock").to_string_lossy().into_owned();

        let serve_address = address.clone();
        let serving = tokio::spawn(async move { test_worker().serve_at(&serve_address).await });

        let connection = dial_with_retry(&address).await;
        handshake(&connection).await;

        connection
            .send_message(&Message::ping("hb-9".into()))
            .await
            .unwrap();
        let pong = Message::decode(&connection.recv_frame().await.unwrap()).unwrap();
        assert_eq!(pong.kind, MessageType::Pong);
        assert_eq!(pong.id.as_deref(), Some("hb-9"));

        connection
            .send_message(&Message::stop("s-1".into()))
            .await
            .unwrap();
        serving.await.unwrap().unwrap();
    }
}
