use crate::elevation::ElevationMechanism;
use crate::error::TetherError;
use crate::strategy::check_remote;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_REMOTE: &str = "https://relay.example.com:8022";
const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub agent: AgentConfig,
    pub elevation: ElevationConfig,
    pub embedded: EmbeddedConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub binary_path: String,
    pub default_remote: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyPreference {
    #[default]
    Auto,
    Elevated,
    Embedded,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct ElevationConfig {
    pub mode: StrategyPreference,
    pub candidates: Vec<ElevationMechanism>,
    pub probe_timeout_ms: u64,
    pub session_timeout_ms: u64,
    pub liveness_delay_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddedConfig {
    pub port_range_start: u16,
    pub port_range_len: u16,
    pub startup_grace_ms: u64,
    /// Agent stdout and stderr are appended here on the embedded path.
    pub log_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct DebugConfig {
    pub tcp_port: u16,
    pub forward_endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            agent: AgentConfig::default(),
            elevation: ElevationConfig::default(),
            embedded: EmbeddedConfig::default(),
            debug: DebugConfig::default(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary_path: "~/.local/share/tether/tether-agent".to_string(),
            default_remote: DEFAULT_REMOTE.to_string(),
            password: "".to_string(),
        }
    }
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            mode: StrategyPreference::Auto,
            candidates: ElevationMechanism::PRIORITY.to_vec(),
            probe_timeout_ms: 5_000,
            session_timeout_ms: 30_000,
            liveness_delay_secs: 2,
        }
    }
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            port_range_start: 8080,
            port_range_len: 100,
            startup_grace_ms: 500,
            log_path: "~/.local/share/tether/agent.log".to_string(),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            tcp_port: 5555,
            forward_endpoint: "agent-adb".to_string(),
        }
    }
}

impl Config {
    pub fn binary_path(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.agent.binary_path))
    }

    pub fn agent_log_path(&self) -> PathBuf {
        PathBuf::from(expand_path(&self.embedded.log_path))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.elevation.probe_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.elevation.session_timeout_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.embedded.startup_grace_ms)
    }

    /// Outer-boundary default: a blank remote falls back to the configured one.
    pub fn effective_remote(&self, requested: Option<&str>) -> String {
        match requested.map(str::trim) {
            Some(remote) if !remote.is_empty() => remote.to_string(),
            _ => self.agent.default_remote.trim().to_string(),
        }
    }
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("TETHER_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("tether");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("TETHER_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

pub fn default_config_yaml() -> &'static str {
    DEFAULT_CONFIG_YAML
}

pub fn read_config_from_str(content: &str) -> Result<Config, TetherError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(TetherError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Reads the config at `path`; a missing file yields the defaults.
pub fn read_config(path: &Path) -> Result<Config, TetherError> {
    if !path.exists() {
        let cfg = Config::default();
        validate_config(&cfg)?;
        return Ok(cfg);
    }
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

pub fn validate_config(cfg: &Config) -> Result<(), TetherError> {
    if cfg.agent.binary_path.trim().is_empty() {
        return Err(TetherError::Config(
            "agent.binary_path must be non-empty".to_string(),
        ));
    }
    check_remote(cfg.agent.default_remote.trim())
        .map_err(|err| TetherError::Config(format!("agent.default_remote: {err}")))?;
    if cfg.elevation.probe_timeout_ms == 0 {
        return Err(TetherError::Config(
            "elevation.probe_timeout_ms must be greater than 0".to_string(),
        ));
    }
    if cfg.elevation.session_timeout_ms == 0 {
        return Err(TetherError::Config(
            "elevation.session_timeout_ms must be greater than 0".to_string(),
        ));
    }
    let liveness_ms = cfg.elevation.liveness_delay_secs.saturating_mul(1_000);
    if liveness_ms >= cfg.elevation.session_timeout_ms {
        return Err(TetherError::Config(format!(
            "elevation.session_timeout_ms ({}) must exceed elevation.liveness_delay_secs ({}s)",
            cfg.elevation.session_timeout_ms, cfg.elevation.liveness_delay_secs
        )));
    }
    let mut seen = BTreeSet::new();
    for mechanism in &cfg.elevation.candidates {
        if !seen.insert(mechanism.as_str()) {
            return Err(TetherError::Config(format!(
                "elevation.candidates lists '{mechanism}' more than once"
            )));
        }
    }
    if cfg.embedded.port_range_start == 0 || cfg.embedded.port_range_len == 0 {
        return Err(TetherError::Config(
            "embedded.port_range_start and embedded.port_range_len must be greater than 0"
                .to_string(),
        ));
    }
    if cfg.embedded.log_path.trim().is_empty() {
        return Err(TetherError::Config(
            "embedded.log_path must be non-empty".to_string(),
        ));
    }
    if cfg.debug.tcp_port == 0 {
        return Err(TetherError::Config(
            "debug.tcp_port must be greater than 0".to_string(),
        ));
    }
    if cfg.debug.forward_endpoint.trim().is_empty() {
        return Err(TetherError::Config(
            "debug.forward_endpoint must be non-empty".to_string(),
        ));
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn ensure_parent(path: &Path) -> Result<(), TetherError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_unknown_field_errors() {
        let yaml = "version: 1\nunknown: true\n";
        let result: Result<Config, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.elevation.mode, StrategyPreference::Auto);
        assert_eq!(
            cfg.elevation.candidates,
            ElevationMechanism::PRIORITY.to_vec()
        );
        assert_eq!(cfg.elevation.probe_timeout_ms, 5_000);
        assert_eq!(cfg.embedded.port_range_start, 8080);
        assert_eq!(cfg.embedded.port_range_len, 100);
        assert_eq!(cfg.debug.tcp_port, 5555);
        assert_eq!(cfg.agent.default_remote, DEFAULT_REMOTE);
    }

    #[test]
    fn bundled_template_is_valid() {
        let cfg = read_config_from_str(default_config_yaml()).expect("template parses");
        assert_eq!(cfg.version, CONFIG_VERSION);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let err = read_config_from_str("version: 7").unwrap_err();
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn duplicate_candidates_are_rejected() {
        let err = read_config_from_str("version: 1\nelevation:\n  candidates: [su, sudo, su]\n")
            .unwrap_err();
        assert!(err.to_string().contains("'su' more than once"));
    }

    #[test]
    fn empty_candidate_list_is_allowed() {
        let cfg = read_config_from_str("version: 1\nelevation:\n  candidates: []\n").unwrap();
        assert!(cfg.elevation.candidates.is_empty());
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let err = read_config_from_str("version: 1\nelevation:\n  session_timeout_ms: 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("session_timeout_ms"));
    }

    #[test]
    fn session_timeout_must_cover_liveness_delay() {
        let err = read_config_from_str("version: 1\nelevation:\n  session_timeout_ms: 1000\n")
            .unwrap_err();
        assert!(err.to_string().contains("must exceed elevation.liveness_delay_secs"));

        let cfg = read_config_from_str(
            "version: 1\nelevation:\n  session_timeout_ms: 3000\n  liveness_delay_secs: 2\n",
        )
        .unwrap();
        assert_eq!(cfg.session_timeout(), Duration::from_secs(3));
    }

    #[test]
    fn default_remote_must_be_a_plain_word() {
        let err = read_config_from_str(
            "version: 1\nagent:\n  default_remote: \"https://h; reboot\"\n",
        )
        .unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(err.to_string().contains("agent.default_remote"));
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let cfg = read_config(&dir.path().join("absent.yaml")).expect("defaults");
        assert_eq!(cfg.version, CONFIG_VERSION);
    }

    #[test]
    fn effective_remote_falls_back_when_blank() {
        let cfg = Config::default();
        assert_eq!(cfg.effective_remote(None), DEFAULT_REMOTE);
        assert_eq!(cfg.effective_remote(Some("   ")), DEFAULT_REMOTE);
        assert_eq!(
            cfg.effective_remote(Some(" https://host ")),
            "https://host"
        );
    }

    #[test]
    fn expand_tilde_works() {
        let expanded = expand_path("~/tether-agent");
        assert!(!expanded.starts_with("~/"));
    }
}
