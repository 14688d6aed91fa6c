use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "host-poller",
    version,
    about = "Executes command documents dropped into a shared directory"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "config/bridge.toml")]
    pub(crate) config: PathBuf,
    #[arg(long)]
    pub(crate) shared_dir: Option<String>,
    #[arg(long)]
    pub(crate) poll_interval_ms: Option<u64>,
    #[arg(long)]
    pub(crate) script_interpreter: Option<String>,
    #[arg(long, default_value = "logs")]
    pub(crate) log_dir: PathBuf,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
    /// Run a single check and exit.
    #[arg(long)]
    pub(crate) once: bool,
}
