//! Plugin and system configuration.
//!
//! The host is a library: configuration arrives as a pre-built
//! [`SystemConfig`] object, never from a file. Validation enforces the
//! per-plugin invariants before any process is spawned.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{ConfigError, Result};

/// How a plugin worker is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// A native executable, launched directly.
    Binary,
    /// A script, launched through an interpreter.
    Script,
}

/// Configuration for a single plugin. Immutable for the lifetime of each
/// instance spawned from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PluginConfig {
    pub kind: PluginKind,

    /// Executable path (binary plugins).
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Interpreter command (script plugins).
    #[serde(default)]
    pub interpreter: Option<String>,

    /// Script path, passed as the interpreter's first argument.
    #[serde(default)]
    pub script_path: Option<PathBuf>,

    /// Number of instances created up front.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Ceiling on concurrently live instances.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// Function names the plugin claims to provide.
    pub functions: Vec<String>,

    /// Environment variable overrides for the worker process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Additional command-line arguments, placed before the address.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Full host configuration: the set of plugins plus platform knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SystemConfig {
    pub plugins: HashMap<String, PluginConfig>,

    /// Directory for Unix domain sockets. Defaults to `/tmp/goproc_sockets`.
    /// Ignored on Windows.
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
}

fn default_pool_size() -> usize {
    3
}

fn default_max_instances() -> usize {
    10
}

impl PluginConfig {
    /// Validate the per-plugin invariants.
    pub fn validate(&self, name: &str) -> Result<()> {
        match self.kind {
            PluginKind::Binary => {
                if self.path.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "binary plugin '{name}' has no executable path"
                    ))
                    .into());
                }
            }
            PluginKind::Script => {
                if self.interpreter.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "script plugin '{name}' has no interpreter"
                    ))
                    .into());
                }
                if self.script_path.is_none() {
                    return Err(ConfigError::Validation(format!(
                        "script plugin '{name}' has no script path"
                    ))
                    .into());
                }
            }
        }

        if self.pool_size == 0 {
            return Err(ConfigError::Validation(format!(
                "plugin '{name}' has a zero pool size"
            ))
            .into());
        }
        if self.pool_size > self.max_instances {
            return Err(ConfigError::Validation(format!(
                "plugin '{name}': pool_size {} exceeds max_instances {}",
                self.pool_size, self.max_instances
            ))
            .into());
        }
        if self.functions.is_empty() {
            return Err(ConfigError::Validation(format!(
                "plugin '{name}' must provide at least one function"
            ))
            .into());
        }

        Ok(())
    }

    /// The command and leading arguments used to launch a worker. The
    /// transport address is appended by the instance at spawn time.
    pub fn command(&self) -> (String, Vec<String>) {
        match self.kind {
            PluginKind::Binary => {
                let program = self
                    .path
                    .as_deref()
                    .unwrap_or_else(|| Path::new(""))
                    .to_string_lossy()
                    .into_owned();
                (program, self.args.clone())
            }
            PluginKind::Script => {
                let program = self.interpreter.clone().unwrap_or_default();
                let mut args = Vec::with_capacity(self.args.len() + 1);
                if let Some(script) = &self.script_path {
                    args.push(script.to_string_lossy().into_owned());
                }
                args.extend(self.args.iter().cloned());
                (program, args)
            }
        }
    }
}

impl SystemConfig {
    /// Validate the whole configuration: at least one plugin, and every
    /// plugin's own invariants.
    pub fn validate(&self) -> Result<()> {
        if self.plugins.is_empty() {
            return Err(
                ConfigError::Validation("at least one plugin must be configured".into()).into(),
            );
        }

        for (name, plugin) in &self.plugins {
            plugin.validate(name)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_config() -> PluginConfig {
        PluginConfig {
            kind: PluginKind::Binary,
            path: Some(PathBuf::from("/usr/local/bin/math-worker")),
            interpreter: None,
            script_path: None,
            pool_size: 2,
            max_instances: 4,
            functions: vec!["add".into()],
            env: HashMap::new(),
            args: vec![],
        }
    }

    #[test]
    fn valid_binary_config_passes() {
        assert!(binary_config().validate("math").is_ok());
    }

    #[test]
    fn binary_without_path_fails() {
        let mut config = binary_config();
        config.path = None;
        assert!(config.validate("math").is_err());
    }

    #[test]
    fn script_requires_interpreter_and_script() {
        let mut config = binary_config();
        config.kind = PluginKind::Script;
        config.path = None;
        assert!(config.validate("py").is_err());

        config.interpreter = Some("python3".into());
        assert!(config.validate("py").is_err());

        config.script_path = Some(PathBuf::from("plugin.py"));
        assert!(config.validate("py").is_ok());
    }

    #[test]
    fn pool_size_invariants() {
        let mut config = binary_config();
        config.pool_size = 0;
        assert!(config.validate("math").is_err());

        config.pool_size = 5;
        config.max_instances = 4;
        assert!(config.validate("math").is_err());
    }

    #[test]
    fn empty_function_list_fails() {
        let mut config = binary_config();
        config.functions.clear();
        assert!(config.validate("math").is_err());
    }

    #[test]
    fn script_command_places_script_first() {
        let config = PluginConfig {
            kind: PluginKind::Script,
            path: None,
            interpreter: Some("python3".into()),
            script_path: Some(PathBuf::from("/opt/plugins/calc.py")),
            pool_size: 1,
            max_instances: 1,
            functions: vec!["calc".into()],
            env: HashMap::new(),
            args: vec!["--verbose".into()],
        };

        let (program, args) = config.command();
        assert_eq!(program, "python3");
        assert_eq!(args, vec!["/opt/plugins/calc.py", "--verbose"]);
    }

    #[test]
    fn system_config_requires_a_plugin() {
        let config = SystemConfig::default();
        assert!(config.validate().is_err());
    }
}
