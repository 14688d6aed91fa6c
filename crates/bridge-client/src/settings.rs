use crate::cli::Args;
use bridge_client::BridgeSettings;
use protocol::config::{
    load_optional_bridge_config, BridgeConfig, TimeoutConfig, DEFAULT_DEBOUNCE_MS,
    DEFAULT_STALE_AFTER_SECS,
};
use std::time::Duration;
use system_utils::path::expand_tilde;

pub(crate) const DEFAULT_SHARED_DIR: &str = "~/.file-bridge";

pub(crate) struct ClientSettings {
    pub(crate) bridge: BridgeSettings,
    pub(crate) timeouts: TimeoutConfig,
}

pub(crate) fn load_client_settings(args: &Args) -> anyhow::Result<ClientSettings> {
    let config = load_optional_bridge_config(&args.config)?;
    build_client_settings(args, config)
}

/// Flags win over the file; the file wins over built-in defaults.
pub(crate) fn build_client_settings(
    args: &Args,
    config: BridgeConfig,
) -> anyhow::Result<ClientSettings> {
    let client = config.client.unwrap_or_default();
    let shared_dir = args
        .shared_dir
        .clone()
        .or(config.shared_dir)
        .unwrap_or_else(|| DEFAULT_SHARED_DIR.to_string());
    let debounce_ms = args
        .debounce_ms
        .or(client.debounce_ms)
        .unwrap_or(DEFAULT_DEBOUNCE_MS);
    let stale_after_secs = args
        .stale_after_secs
        .or(client.stale_after_secs)
        .unwrap_or(DEFAULT_STALE_AFTER_SECS);
    if debounce_ms == 0 {
        anyhow::bail!("--debounce-ms must be greater than zero");
    }
    if stale_after_secs == 0 {
        anyhow::bail!("--stale-after-secs must be greater than zero");
    }

    Ok(ClientSettings {
        bridge: BridgeSettings {
            shared_dir: expand_tilde(&shared_dir),
            debounce: Duration::from_millis(debounce_ms),
            stale_after: Duration::from_secs(stale_after_secs),
            history_path: args
                .history
                .clone()
                .or(client.history_path)
                .map(|path| expand_tilde(&path)),
            project_name: args.project.clone().or(client.project_name),
        },
        timeouts: config.timeouts,
    })
}
