//! Platform abstraction over local bidirectional byte streams.
//!
//! Unix domain sockets on POSIX, named pipes on Windows. The host side uses
//! `dial`/`mint_address`/`cleanup`; the worker SDK uses `listen`. The
//! transport never interprets the bytes that flow across it; framing and
//! envelopes live in the layers above.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

#[cfg(unix)]
pub mod unix;
#[cfg(windows)]
pub mod windows;

/// A raw duplex byte stream, boxed behind the platform boundary.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Bind an endpoint at `address`, replacing any stale artifact.
    async fn listen(&self, address: &str) -> Result<Box<dyn Listener>>;

    /// Connect to an endpoint another process is listening on.
    async fn dial(&self, address: &str) -> Result<Box<dyn IoStream>>;

    /// Mint the endpoint address for one plugin instance.
    fn mint_address(&self, plugin_name: &str, instance_id: &str) -> String;

    /// Remove whatever filesystem artifact `listen` left behind.
    fn cleanup(&self, address: &str) -> Result<()>;
}

#[async_trait]
pub trait Listener: Send {
    async fn accept(&mut self) -> Result<Box<dyn IoStream>>;
}

/// The transport for the build platform. `socket_dir` overrides the Unix
/// socket directory and is ignored on Windows.
pub fn platform_transport(socket_dir: Option<&Path>) -> Arc<dyn Transport> {
    #[cfg(unix)]
    {
        Arc::new(unix::UnixSocketTransport::new(socket_dir))
    }
    #[cfg(windows)]
    {
        let _ = socket_dir;
        Arc::new(windows::NamedPipeTransport::new())
    }
}
