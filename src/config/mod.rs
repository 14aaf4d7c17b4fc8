//! Configuration module for flowgraph-rs
//!
//! A [`GraphConfig`] holds everything a host needs to stand a graph up:
//! - Render settings (execution model, worker thread count)
//! - Logging settings (filter directives, optional rolling log file)
//!
//! Configs are persisted as JSON or TOML; the format is chosen from the file
//! extension (`.toml` for TOML, anything else for JSON).
//!
//! # Example
//!
//! ```no_run
//! use flowgraph_rs::config::GraphConfig;
//! use flowgraph_rs::graph::NodeSet;
//!
//! let config = GraphConfig::load_or_default("flowgraph.toml");
//! let _guard = flowgraph_rs::logging::init(&config.logging)?;
//! let mut set = NodeSet::with_config(&config.render);
//! set.update()?;
//! # Ok::<(), flowgraph_rs::GraphError>(())
//! ```

use crate::error::{GraphError, GraphResult};
use crate::graph::RenderExecutionModel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default tracing filter directives
pub const DEFAULT_LOG_FILTER: &str = "info,flowgraph_rs=debug";

/// Default prefix for rolling log files
pub const DEFAULT_LOG_FILE_PREFIX: &str = "flowgraph.log";

/// Upper bound on worker threads accepted from a config file
pub const MAX_WORKER_THREADS: usize = 256;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Render graph settings
    pub render: RenderConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Render graph settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// How kernels are scheduled each cycle
    pub execution_model: RenderExecutionModel,

    /// Worker pool size; 0 picks the available parallelism
    pub worker_threads: usize,
}

impl RenderConfig {
    /// Worker thread count with 0 resolved against the host
    pub fn resolved_worker_threads(&self) -> usize {
        match self.worker_threads {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n.min(MAX_WORKER_THREADS),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG` when set
    pub filter: String,

    /// Directory for daily rolling log files; console only when unset
    pub directory: Option<PathBuf>,

    /// File name prefix inside `directory`
    pub file_prefix: String,

    /// Colored console output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            directory: None,
            file_prefix: DEFAULT_LOG_FILE_PREFIX.to_string(),
            ansi: true,
        }
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

impl GraphConfig {
    /// Load a config file
    pub fn load(path: impl AsRef<Path>) -> GraphResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            GraphError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        if is_toml(path) {
            Self::from_toml_str(&content)
        } else {
            Self::from_json_str(&content)
        }
    }

    /// Load a config file, returning defaults on any error
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Save to a config file, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> GraphResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                GraphError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = if is_toml(path) {
            toml::to_string_pretty(self)
                .map_err(|e| GraphError::Config(format!("Failed to serialize config: {}", e)))?
        } else {
            serde_json::to_string_pretty(self)
                .map_err(|e| GraphError::Config(format!("Failed to serialize config: {}", e)))?
        };

        std::fs::write(path, content).map_err(|e| {
            GraphError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }

    pub fn from_toml_str(content: &str) -> GraphResult<Self> {
        toml::from_str(content)
            .map_err(|e| GraphError::Config(format!("Failed to parse TOML config: {}", e)))
    }

    pub fn from_json_str(content: &str) -> GraphResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| GraphError::Config(format!("Failed to parse JSON config: {}", e)))
    }
}
