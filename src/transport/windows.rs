//! Windows named pipe transport.

use async_trait::async_trait;
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

use super::{IoStream, Listener, Transport};
use crate::error::{Result, TransportError};

pub struct NamedPipeTransport;

impl NamedPipeTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NamedPipeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for NamedPipeTransport {
    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        let server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(address)
            .map_err(|e| TransportError::ListenFailed {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(NamedPipeListener {
            address: address.to_string(),
            pending: Some(server),
        }))
    }

    async fn dial(&self, address: &str) -> Result<Box<dyn IoStream>> {
        let client = ClientOptions::new()
            .open(address)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Box::new(client))
    }

    fn mint_address(&self, _plugin_name: &str, instance_id: &str) -> String {
        // The instance id already carries the plugin name.
        format!(r"\\.\pipe\{instance_id}")
    }

    fn cleanup(&self, _address: &str) -> Result<()> {
        // Named pipes vanish with their server handle.
        Ok(())
    }
}

struct NamedPipeListener {
    address: String,
    pending: Option<NamedPipeServer>,
}

#[async_trait]
impl Listener for NamedPipeListener {
    async fn accept(&mut self) -> Result<Box<dyn IoStream>> {
        let server = match self.pending.take() {
            Some(server) => server,
            None => ServerOptions::new().create(&self.address).map_err(|e| {
                TransportError::AcceptFailed(e.to_string())
            })?,
        };
        server
            .connect()
            .await
            .map_err(|e| TransportError::AcceptFailed(e.to_string()))?;
        Ok(Box::new(server))
    }
}
