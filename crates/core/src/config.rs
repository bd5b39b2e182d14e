//! TOML-based configuration for the reconciliation engine.
//!
//! Every section is optional; an empty file yields the defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level engine configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Session refresh behaviour.
    #[serde(default)]
    pub session: SessionConfig,

    /// Conflict resolution settings.
    #[serde(default)]
    pub conflicts: ConflictConfig,

    /// External merge tool. Absent means no tool is configured.
    #[serde(default)]
    pub merge_tool: MergeToolConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Run the initial and event-triggered refreshes on a tokio blocking
    /// worker when a runtime is available.
    #[serde(default = "default_true")]
    pub background_refresh: bool,

    /// Refresh as part of opening a session.
    #[serde(default = "default_true")]
    pub refresh_on_open: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            background_refresh: true,
            refresh_on_open: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Conflicts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Message reported by a failed resolution that captured no cause.
    #[serde(default = "default_failure_message")]
    pub default_failure_message: String,
}

fn default_failure_message() -> String {
    "conflicting content changes".into()
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            default_failure_message: default_failure_message(),
        }
    }
}

// ---------------------------------------------------------------------------
// Merge tool
// ---------------------------------------------------------------------------

/// External three-way merge tool.
///
/// Argument placeholders: `%1` their file, `%2` your file, `%3` base file,
/// `%4` merged output, `%5` display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeToolConfig {
    pub command: Option<String>,

    #[serde(default)]
    pub arguments: Vec<String>,

    /// Try an in-process automerge before launching the tool.
    #[serde(default = "default_true")]
    pub try_automerge_first: bool,

    /// File extensions the tool handles (without the dot). Empty means all.
    #[serde(default)]
    pub extensions: Vec<String>,
}

impl Default for MergeToolConfig {
    fn default() -> Self {
        Self {
            command: None,
            arguments: Vec::new(),
            try_automerge_first: true,
            extensions: Vec::new(),
        }
    }
}

impl MergeToolConfig {
    /// Whether the tool should be used for `path`.
    pub fn applies_to(&self, path: &str) -> bool {
        if self.command.is_none() {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        self.extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }

    /// Substitute the placeholders in every argument.
    pub fn expand_arguments(
        &self,
        their_file: &str,
        your_file: &str,
        base_file: &str,
        merged_file: &str,
        display_name: &str,
    ) -> Vec<String> {
        self.arguments
            .iter()
            .map(|arg| {
                arg.replace("%1", their_file)
                    .replace("%2", your_file)
                    .replace("%3", base_file)
                    .replace("%4", merged_file)
                    .replace("%5", display_name)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level, or a full `EnvFilter` directive.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "off"];

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl EngineConfig {
    /// Load an [`EngineConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&contents)?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate that the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tool = &self.merge_tool;
        match tool.command.as_deref() {
            Some(command) if command.trim().is_empty() => {
                return Err(ConfigError::InvalidValue {
                    field: "merge_tool.command".into(),
                    detail: "merge tool command must not be empty".into(),
                });
            }
            Some(_) => {
                if !tool.arguments.iter().any(|a| a.contains("%4")) {
                    return Err(ConfigError::InvalidValue {
                        field: "merge_tool.arguments".into(),
                        detail: "arguments must pass the merged output file (%4)".into(),
                    });
                }
            }
            None if !tool.arguments.is_empty() => {
                return Err(ConfigError::InvalidValue {
                    field: "merge_tool.command".into(),
                    detail: "arguments are configured without a command".into(),
                });
            }
            None => {}
        }

        let level = self.logging.level.trim();
        if !level.contains('=') && !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".into(),
                detail: format!("unknown log level '{level}'"),
            });
        }

        if self.conflicts.default_failure_message.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "conflicts.default_failure_message".into(),
                detail: "default failure message must not be empty".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}
