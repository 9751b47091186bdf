//! Shared fixtures for integration tests: system configs pointing at the
//! compiled `math-worker` binary, with a private socket directory per test.

use plugmux::{PluginConfig, PluginKind, SystemConfig};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const WORKER_BIN: &str = env!("CARGO_BIN_EXE_math-worker");

pub fn math_plugin(pool_size: usize, max_instances: usize) -> PluginConfig {
    PluginConfig {
        kind: PluginKind::Binary,
        path: Some(PathBuf::from(WORKER_BIN)),
        interpreter: None,
        script_path: None,
        pool_size,
        max_instances,
        functions: ["add", "subtract", "multiply", "divide", "echo", "sleep_ms"]
            .iter()
            .map(|f| f.to_string())
            .collect(),
        env: HashMap::new(),
        args: vec![],
    }
}

pub fn math_system(socket_dir: &Path, pool_size: usize, max_instances: usize) -> SystemConfig {
    let mut plugins = HashMap::new();
    plugins.insert("math".to_string(), math_plugin(pool_size, max_instances));
    SystemConfig {
        plugins,
        socket_dir: Some(socket_dir.to_path_buf()),
    }
}

pub fn operands(pairs: &[(&str, f64)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), Value::from(*value)))
        .collect()
}
