//! Unix domain socket transport.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};

use super::{IoStream, Listener, Transport};
use crate::error::{Result, TransportError};

/// Shared directory for all instance sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp/goproc_sockets";

pub struct UnixSocketTransport {
    socket_dir: PathBuf,
}

impl UnixSocketTransport {
    pub fn new(socket_dir: Option<&Path>) -> Self {
        Self {
            socket_dir: socket_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_DIR)),
        }
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>> {
        // A previous instance may have died without unlinking its socket.
        match tokio::fs::remove_file(address).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(TransportError::ListenFailed {
                    address: address.to_string(),
                    reason: format!("failed to remove stale socket: {e}"),
                }
                .into())
            }
        }

        if let Some(dir) = Path::new(address).parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| TransportError::ListenFailed {
                    address: address.to_string(),
                    reason: format!("failed to create socket directory: {e}"),
                })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = tokio::fs::set_permissions(
                    dir,
                    std::fs::Permissions::from_mode(0o755),
                )
                .await;
            }
        }

        let listener = UnixListener::bind(address).map_err(|e| TransportError::ListenFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Box::new(UnixSocketListener { listener }))
    }

    async fn dial(&self, address: &str) -> Result<Box<dyn IoStream>> {
        let stream = UnixStream::connect(address)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Box::new(stream))
    }

    fn mint_address(&self, plugin_name: &str, instance_id: &str) -> String {
        self.socket_dir
            .join(format!("{plugin_name}-{instance_id}.sock"))
            .to_string_lossy()
            .into_owned()
    }

    fn cleanup(&self, address: &str) -> Result<()> {
        match std::fs::remove_file(address) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct UnixSocketListener {
    listener: UnixListener,
}

#[async_trait]
impl Listener for UnixSocketListener {
    async fn accept(&mut self) -> Result<Box<dyn IoStream>> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| TransportError::AcceptFailed(e.to_string()))?;
        Ok(Box::new(stream))
    }
}
