pub mod builtin;
pub mod executor;
pub mod handler;
pub mod poller;
pub mod progress;

pub use executor::{CycleOutcome, Executor};
pub use handler::{CommandHandler, HandlerContext, HandlerError, HandlerRegistry, ScriptSettings};
pub use poller::{run_poller, PollerStats};
