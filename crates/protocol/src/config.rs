use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_STALE_AFTER_SECS: u64 = 30;

/// Shared configuration file read by both the client and the host poller.
/// Every value is optional; command line flags fill the gaps.
#[derive(Debug, Default, Deserialize)]
pub struct BridgeConfig {
    pub shared_dir: Option<String>,
    pub client: Option<ClientDefaults>,
    pub host: Option<HostDefaults>,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClientDefaults {
    pub debounce_ms: Option<u64>,
    pub stale_after_secs: Option<u64>,
    pub history_path: Option<String>,
    pub project_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HostDefaults {
    pub poll_interval_ms: Option<u64>,
    pub script_interpreter: Option<String>,
    pub script_args: Option<Vec<String>>,
    pub max_output_bytes: Option<u64>,
}

/// Process-level timeouts for scripts the host launches, per operation class.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_quick_secs")]
    pub quick_secs: u64,
    #[serde(default = "default_standard_secs")]
    pub standard_secs: u64,
    #[serde(default = "default_render_secs")]
    pub render_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            quick_secs: default_quick_secs(),
            standard_secs: default_standard_secs(),
            render_secs: default_render_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn for_class(&self, class: OperationClass) -> Duration {
        let secs = match class {
            OperationClass::Quick => self.quick_secs,
            OperationClass::Standard => self.standard_secs,
            OperationClass::Render => self.render_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    Quick,
    #[default]
    Standard,
    Render,
}

fn default_quick_secs() -> u64 {
    30
}

fn default_standard_secs() -> u64 {
    120
}

fn default_render_secs() -> u64 {
    600
}

fn validate_bridge_config(config: &BridgeConfig) -> anyhow::Result<()> {
    if let Some(dir) = config.shared_dir.as_deref() {
        if dir.trim().is_empty() {
            anyhow::bail!("shared_dir cannot be empty");
        }
    }
    if let Some(client) = config.client.as_ref() {
        if client.debounce_ms == Some(0) {
            anyhow::bail!("client.debounce_ms must be greater than zero");
        }
        if client.stale_after_secs == Some(0) {
            anyhow::bail!("client.stale_after_secs must be greater than zero");
        }
    }
    if let Some(host) = config.host.as_ref() {
        if host.poll_interval_ms == Some(0) {
            anyhow::bail!("host.poll_interval_ms must be greater than zero");
        }
        if let Some(interpreter) = host.script_interpreter.as_deref() {
            if interpreter.trim().is_empty() {
                anyhow::bail!("host.script_interpreter cannot be empty");
            }
        }
    }
    let timeouts = &config.timeouts;
    if timeouts.quick_secs == 0 || timeouts.standard_secs == 0 || timeouts.render_secs == 0 {
        anyhow::bail!("timeouts must be greater than zero");
    }
    Ok(())
}

pub fn parse_bridge_config(raw: &str) -> anyhow::Result<BridgeConfig> {
    let config: BridgeConfig = toml::from_str(raw)?;
    validate_bridge_config(&config)?;
    Ok(config)
}

pub fn load_bridge_config(path: &Path) -> anyhow::Result<BridgeConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_bridge_config(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

/// A missing file is not an error: defaults apply.
pub fn load_optional_bridge_config(path: &Path) -> anyhow::Result<BridgeConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(BridgeConfig::default());
    }
    load_bridge_config(path)
}
