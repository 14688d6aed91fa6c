use clap::{Parser, Subcommand, ValueEnum};
use protocol::config::OperationClass;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "bridge",
    version,
    about = "Send commands to a host application through a shared directory"
)]
pub(crate) struct Args {
    #[arg(long, default_value = "config/bridge.toml")]
    pub(crate) config: PathBuf,
    #[arg(long)]
    pub(crate) shared_dir: Option<String>,
    #[arg(long)]
    pub(crate) debounce_ms: Option<u64>,
    #[arg(long)]
    pub(crate) stale_after_secs: Option<u64>,
    #[arg(long)]
    pub(crate) history: Option<String>,
    #[arg(long)]
    pub(crate) project: Option<String>,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Dispatch one tool call.
    Send {
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(default_value = "{}")]
        args: String,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Dispatch every call in a JSON array of `{"tool", "args"}` objects as one batch.
    Batch {
        /// Read from stdin when omitted.
        file: Option<PathBuf>,
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Print the current result document.
    #[command(name = "result")]
    ReadResult,
    /// Poll the result document until it settles.
    Wait {
        #[arg(long, value_enum, default_value_t = ClassArg::Standard)]
        class: ClassArg,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
    },
    /// Copy per-command host outcomes from the current result into history.
    Reconcile,
    /// Stage a script file and ask the host to run it.
    RunScript {
        file: PathBuf,
        /// Name under the shared scripts directory; defaults to the file name.
        #[arg(long)]
        name: Option<String>,
        #[command(flatten)]
        wait: WaitArgs,
    },
    #[command(subcommand)]
    History(HistoryCommand),
}

#[derive(clap::Args, Debug, Clone)]
pub(crate) struct WaitArgs {
    /// Wait for the host to finish before exiting.
    #[arg(long)]
    pub(crate) wait: bool,
    /// Operation class; picks the wait timeout.
    #[arg(long, value_enum, default_value_t = ClassArg::Standard)]
    pub(crate) class: ClassArg,
    #[arg(long)]
    pub(crate) timeout_secs: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub(crate) enum HistoryCommand {
    List {
        #[arg(long)]
        tool: Option<String>,
        #[arg(long, value_enum)]
        result: Option<ResultArg>,
        /// RFC 3339 timestamp.
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Stats,
    /// Write a shell script that replays successful state-changing calls.
    Export {
        #[arg(long = "tool")]
        tools: Vec<String>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ClassArg {
    Quick,
    Standard,
    Render,
}

impl From<ClassArg> for OperationClass {
    fn from(value: ClassArg) -> Self {
        match value {
            ClassArg::Quick => OperationClass::Quick,
            ClassArg::Standard => OperationClass::Standard,
            ClassArg::Render => OperationClass::Render,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ResultArg {
    Success,
    Error,
    Pending,
}
