use crate::cli::Args;
use host_poller::{HandlerContext, ScriptSettings};
use protocol::config::{load_optional_bridge_config, BridgeConfig, DEFAULT_POLL_INTERVAL_MS};
use protocol::SharedDir;
use std::time::Duration;
use system_utils::path::expand_tilde;

pub(crate) const DEFAULT_SHARED_DIR: &str = "~/.file-bridge";

pub(crate) struct HostSettings {
    pub(crate) poll_interval: Duration,
    pub(crate) context: HandlerContext,
}

pub(crate) fn load_host_settings(args: &Args) -> anyhow::Result<HostSettings> {
    let config = load_optional_bridge_config(&args.config)?;
    build_host_settings(args, config)
}

/// Flags win over the file; the file wins over built-in defaults.
pub(crate) fn build_host_settings(args: &Args, config: BridgeConfig) -> anyhow::Result<HostSettings> {
    let host = config.host.unwrap_or_default();
    let shared_dir = args
        .shared_dir
        .clone()
        .or(config.shared_dir)
        .unwrap_or_else(|| DEFAULT_SHARED_DIR.to_string());
    let poll_interval_ms = args
        .poll_interval_ms
        .or(host.poll_interval_ms)
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_interval_ms == 0 {
        anyhow::bail!("--poll-interval-ms must be greater than zero");
    }

    let defaults = ScriptSettings::default();
    let scripts = ScriptSettings {
        interpreter: args
            .script_interpreter
            .clone()
            .or(host.script_interpreter)
            .unwrap_or(defaults.interpreter),
        args: host.script_args.unwrap_or(defaults.args),
        max_output_bytes: host
            .max_output_bytes
            .map(|bytes| usize::try_from(bytes).unwrap_or(usize::MAX))
            .unwrap_or(defaults.max_output_bytes),
    };

    let mut context = HandlerContext::new(SharedDir::new(expand_tilde(&shared_dir)));
    context.timeouts = config.timeouts;
    context.scripts = scripts;
    Ok(HostSettings {
        poll_interval: Duration::from_millis(poll_interval_ms),
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use protocol::config::{parse_bridge_config, OperationClass};
    use std::path::Path;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["host-poller"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).expect("parse")
    }

    #[test]
    fn defaults_apply_without_file_or_flags() {
        let settings = build_host_settings(&args(&[]), BridgeConfig::default()).expect("settings");
        assert_eq!(settings.poll_interval, Duration::from_millis(1000));
        assert_eq!(settings.context.scripts.interpreter, "sh");
    }

    #[test]
    fn file_values_fill_gaps_and_flags_win() {
        let config = parse_bridge_config(
            "shared_dir = \"/srv/bridge\"\n\
             [host]\npoll_interval_ms = 2000\nscript_interpreter = \"bash\"\nscript_args = [\"-e\"]\n\
             [timeouts]\nrender_secs = 900\n",
        )
        .expect("config");
        let settings =
            build_host_settings(&args(&["--poll-interval-ms", "250"]), config).expect("settings");
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.context.dir.root(), Path::new("/srv/bridge"));
        assert_eq!(settings.context.scripts.interpreter, "bash");
        assert_eq!(settings.context.scripts.args, vec!["-e".to_string()]);
        assert_eq!(
            settings.context.timeouts.for_class(OperationClass::Render),
            Duration::from_secs(900)
        );
    }

    #[test]
    fn zero_interval_flag_is_rejected() {
        assert!(build_host_settings(&args(&["--poll-interval-ms", "0"]), BridgeConfig::default()).is_err());
    }
}
