mod cli;
mod logging;
mod settings;
mod shutdown;

use clap::Parser;
use cli::Args;
use host_poller::builtin::register_builtins;
use host_poller::{run_poller, Executor, HandlerRegistry};
use logging::{init_tracing, LOG_FILE_PREFIX};
use settings::load_host_settings;
use shutdown::spawn_shutdown_handler;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _file_guard = init_tracing(&args.log_dir, LOG_FILE_PREFIX, args.log_to_stderr)?;

    let settings = load_host_settings(&args)?;
    settings.context.dir.ensure().await?;

    let mut registry = HandlerRegistry::new();
    register_builtins(&mut registry);
    let mut executor = Executor::new(registry, settings.context);

    if args.once {
        let outcome = executor.run_cycle().await?;
        tracing::info!(event = "single_check", outcome = ?outcome);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    spawn_shutdown_handler(shutdown.clone());
    run_poller(&mut executor, settings.poll_interval, shutdown).await;
    Ok(())
}
