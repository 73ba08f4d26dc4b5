//! ---
//! keel_section: "01-core-functionality"
//! keel_subsection: "module"
//! keel_type: "source"
//! keel_scope: "code"
//! keel_description: "Shared primitives and utilities for the rebind runtime."
//! keel_version: "v0.0.0-prealpha"
//! keel_owner: "tbd"
//! ---
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::quorum::QuorumCheck;

fn default_node_state() -> NodeState {
    NodeState::Master
}

fn default_true() -> bool {
    true
}

fn default_standby_refresh_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_log_burst() -> u64 {
    5
}

fn default_log_period() -> u64 {
    1000
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("target/keel/snapshot.json")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

/// Primary configuration object for a keel management node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub rebind: RebindConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "KEEL_CONFIG";

    /// Load configuration from disk, respecting the `KEEL_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.rebind.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// High-availability state of a management node.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NodeState {
    #[default]
    Initializing,
    Standby,
    HotStandby,
    HotBackup,
    Master,
    Failed,
    Terminated,
}

impl NodeState {
    /// Hot proxies keep a read-only copy of the live graph.
    pub fn is_hot_proxy(&self) -> bool {
        matches!(self, NodeState::HotStandby | NodeState::HotBackup)
    }

    /// Whether a rebind may target this state at all.
    pub fn can_rebind(&self) -> bool {
        self.is_hot_proxy() || matches!(self, NodeState::Master)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Initializing => "INITIALIZING",
            NodeState::Standby => "STANDBY",
            NodeState::HotStandby => "HOT_STANDBY",
            NodeState::HotBackup => "HOT_BACKUP",
            NodeState::Master => "MASTER",
            NodeState::Failed => "FAILED",
            NodeState::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "initializing" => Ok(NodeState::Initializing),
            "standby" => Ok(NodeState::Standby),
            "hot-standby" => Ok(NodeState::HotStandby),
            "hot-backup" => Ok(NodeState::HotBackup),
            "master" => Ok(NodeState::Master),
            "failed" => Ok(NodeState::Failed),
            "terminated" => Ok(NodeState::Terminated),
            other => Err(format!("unknown node state: {}", other)),
        }
    }
}

/// Response applied to one category of rebind failure.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    FailFast,
    FailAtEnd,
    Continue,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureMode::FailFast => "FAIL_FAST",
            FailureMode::FailAtEnd => "FAIL_AT_END",
            FailureMode::Continue => "CONTINUE",
        })
    }
}

impl std::str::FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "fail-fast" => Ok(FailureMode::FailFast),
            "fail-at-end" => Ok(FailureMode::FailAtEnd),
            "continue" => Ok(FailureMode::Continue),
            other => Err(format!("unknown failure mode: {}", other)),
        }
    }
}

/// The five independently configurable failure responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureModes {
    #[serde(default = "FailureModes::default_dangling_ref")]
    pub dangling_ref: FailureMode,
    #[serde(default = "FailureModes::default_rebind")]
    pub rebind: FailureMode,
    #[serde(default = "FailureModes::default_add_config")]
    pub add_config: FailureMode,
    #[serde(default = "FailureModes::default_add_policy")]
    pub add_policy: FailureMode,
    #[serde(default = "FailureModes::default_load_policy")]
    pub load_policy: FailureMode,
}

impl FailureModes {
    const fn default_dangling_ref() -> FailureMode {
        FailureMode::Continue
    }

    const fn default_rebind() -> FailureMode {
        FailureMode::FailAtEnd
    }

    const fn default_add_config() -> FailureMode {
        FailureMode::FailAtEnd
    }

    const fn default_add_policy() -> FailureMode {
        FailureMode::Continue
    }

    const fn default_load_policy() -> FailureMode {
        FailureMode::Continue
    }

    /// Every category set to the same mode; handy for strict test runs.
    pub fn uniform(mode: FailureMode) -> Self {
        Self {
            dangling_ref: mode,
            rebind: mode,
            add_config: mode,
            add_policy: mode,
            load_policy: mode,
        }
    }
}

impl Default for FailureModes {
    fn default() -> Self {
        Self {
            dangling_ref: Self::default_dangling_ref(),
            rebind: Self::default_rebind(),
            add_config: Self::default_add_config(),
            add_policy: Self::default_add_policy(),
            load_policy: Self::default_load_policy(),
        }
    }
}

/// Run configuration for the rebind engine.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebindConfig {
    #[serde(default = "default_node_state")]
    pub node_state: NodeState,
    #[serde(default = "default_true")]
    pub persist_catalog_items: bool,
    #[serde(default = "default_true")]
    pub persist_policies: bool,
    #[serde(default = "default_true")]
    pub persist_enrichers: bool,
    #[serde(default = "default_true")]
    pub persist_feeds: bool,
    /// Retry a dangling versioned catalog reference against its symbolic name.
    #[serde(default = "default_true")]
    pub auto_fix_catalog_refs: bool,
    /// Infer missing catalog item ids from ancestors, type names, and bundle scans.
    #[serde(default = "default_true")]
    pub infer_catalog_item_on_rebind: bool,
    #[serde(default)]
    pub reset_catalog_on_first_run: bool,
    #[serde(default)]
    pub failure_modes: FailureModes,
    #[serde(default)]
    pub dangling_quorum: QuorumCheck,
    #[serde(default = "default_standby_refresh_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub standby_refresh_interval: Duration,
    #[serde(default = "default_log_burst")]
    pub log_burst: u64,
    #[serde(default = "default_log_period")]
    pub log_period: u64,
}

impl RebindConfig {
    pub fn validate(&self) -> Result<()> {
        if self.log_period == 0 {
            return Err(anyhow!("rebind.log_period must be greater than zero"));
        }
        if self.standby_refresh_interval.is_zero() {
            return Err(anyhow!(
                "rebind.standby_refresh_interval must be greater than zero"
            ));
        }
        self.dangling_quorum.validate()?;
        Ok(())
    }
}

impl Default for RebindConfig {
    fn default() -> Self {
        Self {
            node_state: default_node_state(),
            persist_catalog_items: true,
            persist_policies: true,
            persist_enrichers: true,
            persist_feeds: true,
            auto_fix_catalog_refs: true,
            infer_catalog_item_on_rebind: true,
            reset_catalog_on_first_run: false,
            failure_modes: FailureModes::default(),
            dangling_quorum: QuorumCheck::default(),
            standby_refresh_interval: default_standby_refresh_interval(),
            log_burst: default_log_burst(),
            log_period: default_log_period(),
        }
    }
}

/// Encoding used for snapshot files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    #[default]
    Json,
    Cbor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub format: SnapshotFormat,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            path: default_snapshot_path(),
            format: SnapshotFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: AppConfig = "[rebind]\nnode_state = \"hot-standby\"\n".parse().unwrap();
        assert_eq!(config.rebind.node_state, NodeState::HotStandby);
        assert!(config.rebind.persist_catalog_items);
        assert_eq!(config.rebind.failure_modes, FailureModes::default());
        assert_eq!(config.rebind.standby_refresh_interval, Duration::from_secs(1));
    }

    #[test]
    fn parses_failure_modes_and_quorum() {
        let raw = r#"
            [rebind]
            persist_feeds = false

            [rebind.failure_modes]
            add_config = "fail-fast"
            dangling_ref = "fail-at-end"

            [rebind.dangling_quorum]
            kind = "fraction"
            min = 0.9
        "#;
        let config: AppConfig = raw.parse().unwrap();
        assert!(!config.rebind.persist_feeds);
        assert_eq!(config.rebind.failure_modes.add_config, FailureMode::FailFast);
        assert_eq!(config.rebind.failure_modes.dangling_ref, FailureMode::FailAtEnd);
        assert_eq!(config.rebind.failure_modes.rebind, FailureMode::FailAtEnd);
        assert_eq!(config.rebind.dangling_quorum, QuorumCheck::Fraction { min: 0.9 });
    }

    #[test]
    fn rejects_zero_log_period() {
        let err = "[rebind]\nlog_period = 0\n".parse::<AppConfig>().unwrap_err();
        assert!(err.to_string().contains("log_period"));
    }

    #[test]
    fn node_state_round_trips_through_strings() {
        for state in [
            NodeState::Master,
            NodeState::HotStandby,
            NodeState::HotBackup,
            NodeState::Failed,
        ] {
            let parsed: NodeState = state.as_str().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!(NodeState::HotBackup.is_hot_proxy());
        assert!(!NodeState::Standby.can_rebind());
    }
}
