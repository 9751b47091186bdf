use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Pool exhausted: no instance became available in time")]
    PoolExhausted,

    #[error("Call timed out waiting for a response")]
    CallTimeout,

    /// The worker answered with an `error` frame; the message is verbatim.
    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Instance {0} is not connected")]
    NotConnected(String),

    #[error("Function '{function}' is not registered by plugin '{plugin}'")]
    UnknownFunction { plugin: String, function: String },

    #[error("Connection to plugin process lost")]
    ConnectionLost,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Pool '{0}' is not running")]
    PoolNotRunning(String),

    #[error("Plugin manager is not running")]
    NotRunning,

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("Plugin '{0}' already exists")]
    PluginExists(String),

    #[error("Failed to start: {0}")]
    StartFailed(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Listen failed on {address}: {reason}")]
    ListenFailed { address: String, reason: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Accept failed: {0}")]
    AcceptFailed(String),

    #[error("Timed out waiting for a connection")]
    AcceptTimeout,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, HostError>;
