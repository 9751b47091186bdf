//! Out-of-process plugin host.
//!
//! Embed a [`PluginManager`] in a parent application to launch external
//! worker processes (native binaries or script interpreters), rendezvous
//! with each over a local transport (Unix domain sockets on POSIX, named
//! pipes on Windows), and call named functions they register:
//!
//! ```no_run
//! # use plugmux::{PluginConfig, PluginKind, PluginManager, SystemConfig};
//! # use std::collections::HashMap;
//! # async fn demo() -> plugmux::Result<()> {
//! let mut plugins = HashMap::new();
//! plugins.insert("math".to_string(), PluginConfig {
//!     kind: PluginKind::Binary,
//!     path: Some("/usr/local/bin/math-worker".into()),
//!     interpreter: None,
//!     script_path: None,
//!     pool_size: 2,
//!     max_instances: 5,
//!     functions: vec!["add".into()],
//!     env: HashMap::new(),
//!     args: vec![],
//! });
//!
//! let manager = PluginManager::new(SystemConfig { plugins, socket_dir: None });
//! manager.start().await?;
//!
//! let mut params = serde_json::Map::new();
//! params.insert("a".into(), 10.into());
//! params.insert("b".into(), 5.into());
//! let result = manager.call("math", "add", params).await?;
//! assert_eq!(result, serde_json::Value::from(15));
//!
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! Each plugin is served by a pool of worker instances with bounded,
//! elastic growth; per-instance connection locking keeps request/response
//! pairs from interleaving on a shared stream. Workers are written with the
//! [`worker`] module's SDK, or in any language that speaks the framed JSON
//! protocol in [`message`].
//!
//! The host is a library, not a daemon: there is no CLI, no listening port,
//! and no config file read here. The manager takes a pre-built
//! [`SystemConfig`].

pub mod config;
pub mod error;
pub mod framing;
pub mod instance;
pub mod manager;
pub mod message;
pub mod pool;
pub mod transport;
pub mod worker;

pub use config::{PluginConfig, PluginKind, SystemConfig};
pub use error::{HostError, Result};
pub use instance::InstanceStatus;
pub use manager::{ManagerStatus, PluginManager};
pub use pool::PoolStatus;
pub use worker::Worker;
