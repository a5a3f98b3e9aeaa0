//! Run configuration for the Maestro server.
//!
//! Loaded from an optional `maestro.yml`; every field has a default so an
//! absent or partial file is fine. CLI flags override file values.

use maestro_proto::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Tunables for one server run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaestroConfig {
    /// Seconds before a running command is terminated.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Per-stream cap for the UI copy of tool output, in bytes.
    #[serde(default = "default_truncate_bytes")]
    pub truncate_bytes: usize,

    /// Demo gating: a failed verification earns corrective retry cycles.
    #[serde(default)]
    pub gated: bool,

    /// Retry budget when gating is active.
    #[serde(default = "default_max_gated_retries")]
    pub max_gated_retries: u32,

    /// Cap on a single buffered protocol line, in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_command_timeout_secs() -> u64 {
    300
}

fn default_truncate_bytes() -> usize {
    200 * 1024
}

fn default_max_gated_retries() -> u32 {
    1
}

fn default_max_line_bytes() -> usize {
    maestro_proto::DEFAULT_MAX_LINE_BYTES
}

impl Default for MaestroConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout_secs(),
            truncate_bytes: default_truncate_bytes(),
            gated: false,
            max_gated_retries: default_max_gated_retries(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl MaestroConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| maestro_proto::Error::Protocol(format!("invalid config: {e}")))?;
        Ok(config)
    }

    /// Loads from `path` when it exists, otherwise returns defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            debug!(path = %path.display(), "loading config file");
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }
}
