//! Settings parsing.
//!
//! A target repository may carry `database/repokit.kdl`:
//!
//! ```kdl
//! host "localhost"
//! namespace "integration"
//! admin user="postgres" database="postgres"
//! reset strategy="delete-rows"
//! wait {
//!     database max-seconds=10 poll-ms=200
//!     pod max-seconds=600 poll-ms=2000
//! }
//! tools {
//!     psql "/usr/local/bin/psql"
//!     sqitch "sqitch"
//!     docker "docker"
//! }
//! ```

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use repokit_core::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file location, relative to the repository root.
pub const SETTINGS_FILE: &str = "database/repokit.kdl";

/// What `reset-data` does when the repository has no reset script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetStrategy {
    /// Drop the database and role, then run schema setup again.
    #[default]
    Recreate,
    /// Delete every row from every user table; keeps schema and grants.
    DeleteRows,
}

impl std::str::FromStr for ResetStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s {
            "recreate" => Ok(ResetStrategy::Recreate),
            "delete-rows" => Ok(ResetStrategy::DeleteRows),
            other => Err(ConfigError::InvalidValue {
                field: "reset strategy".to_string(),
                message: format!("expected 'recreate' or 'delete-rows', got '{}'", other),
            }),
        }
    }
}

/// External tool binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSettings {
    pub psql: String,
    pub sqitch: String,
    pub docker: String,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            psql: "psql".to_string(),
            sqitch: "sqitch".to_string(),
            docker: "docker".to_string(),
        }
    }
}

/// Resolved settings for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Host to advertise for local instances. Detected when unset.
    pub host: Option<String>,
    /// Kubernetes namespace for pods.
    pub namespace: String,
    /// Superuser role used for setup and destructive resets.
    pub admin_user: String,
    /// Maintenance database the superuser connects to.
    pub admin_database: String,
    pub reset_strategy: ResetStrategy,
    pub database_wait: WaitPolicy,
    pub pod_wait: WaitPolicy,
    pub tools: ToolSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: None,
            namespace: "default".to_string(),
            admin_user: "postgres".to_string(),
            admin_database: "postgres".to_string(),
            reset_strategy: ResetStrategy::default(),
            database_wait: WaitPolicy::database(),
            pod_wait: WaitPolicy::pod(),
            tools: ToolSettings::default(),
        }
    }
}

impl Settings {
    /// Apply `PSQL_BIN`, `SQITCH_BIN` and `DOCKER_BIN` from an environment snapshot.
    pub fn with_env_overrides(mut self, env: &HashMap<String, String>) -> Self {
        if let Some(bin) = env.get("PSQL_BIN") {
            self.tools.psql = bin.clone();
        }
        if let Some(bin) = env.get("SQITCH_BIN") {
            self.tools.sqitch = bin.clone();
        }
        if let Some(bin) = env.get("DOCKER_BIN") {
            self.tools.docker = bin.clone();
        }
        self
    }
}

/// Path of the settings file inside a repository.
pub fn settings_path(repo_path: &Path) -> PathBuf {
    repo_path.join(SETTINGS_FILE)
}

/// Load settings for a repository, falling back to defaults when it has no settings file.
pub fn load_settings(repo_path: &Path) -> ConfigResult<Settings> {
    let path = settings_path(repo_path);
    if !path.is_file() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(&path)?;
    parse_settings(&content)
}

/// Parse settings from KDL text. Unset fields keep their defaults.
pub fn parse_settings(kdl: &str) -> ConfigResult<Settings> {
    let doc: KdlDocument = kdl.parse()?;
    let mut settings = Settings::default();

    for node in doc.nodes() {
        match node.name().value() {
            "host" => {
                settings.host = Some(
                    get_first_string_arg(node)
                        .ok_or_else(|| ConfigError::MissingField("host value".to_string()))?,
                );
            }
            "namespace" => {
                settings.namespace = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("namespace value".to_string()))?;
            }
            "admin" => {
                if let Some(user) = get_string_prop(node, "user") {
                    settings.admin_user = user;
                }
                if let Some(database) = get_string_prop(node, "database") {
                    settings.admin_database = database;
                }
            }
            "reset" => {
                let strategy = get_string_prop(node, "strategy")
                    .or_else(|| get_first_string_arg(node))
                    .ok_or_else(|| ConfigError::MissingField("reset strategy".to_string()))?;
                settings.reset_strategy = strategy.parse()?;
            }
            "wait" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        match child.name().value() {
                            "database" => {
                                settings.database_wait =
                                    parse_wait(child, settings.database_wait)?;
                            }
                            "pod" => {
                                settings.pod_wait = parse_wait(child, settings.pod_wait)?;
                            }
                            other => {
                                return Err(ConfigError::InvalidValue {
                                    field: "wait".to_string(),
                                    message: format!("unknown wait target: {}", other),
                                });
                            }
                        }
                    }
                }
            }
            "tools" => {
                if let Some(children) = node.children() {
                    for child in children.nodes() {
                        let bin = get_first_string_arg(child).ok_or_else(|| {
                            ConfigError::MissingField(format!(
                                "binary for tool {}",
                                child.name().value()
                            ))
                        })?;
                        match child.name().value() {
                            "psql" => settings.tools.psql = bin,
                            "sqitch" => settings.tools.sqitch = bin,
                            "docker" => settings.tools.docker = bin,
                            _ => {} // Ignore unknown tools
                        }
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(settings)
}

fn parse_wait(node: &KdlNode, current: WaitPolicy) -> ConfigResult<WaitPolicy> {
    let field = format!("wait.{}", node.name().value());

    let max_wait = match get_integer_prop(node, "max-seconds", &field)? {
        Some(secs) => Duration::from_secs(secs),
        None => current.max_wait,
    };
    let poll_interval = match get_integer_prop(node, "poll-ms", &field)? {
        Some(0) => {
            return Err(ConfigError::InvalidValue {
                field,
                message: "poll-ms must be positive".to_string(),
            });
        }
        Some(ms) => Duration::from_millis(ms),
        None => current.poll_interval,
    };

    Ok(WaitPolicy::new(max_wait, poll_interval))
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_integer_prop(node: &KdlNode, name: &str, field: &str) -> ConfigResult<Option<u64>> {
    let Some(value) = node.get(name) else {
        return Ok(None);
    };
    value
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .map(Some)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: format!("{}.{}", field, name),
            message: format!("expected a non-negative integer, got {}", value),
        })
}
