pub mod batcher;
pub mod bridge;
pub mod history;
pub mod reader;

pub use batcher::{CommandBatcher, DocumentShape, FlushReceipt, PendingDispatch};
pub use bridge::{Bridge, BridgeSettings, DispatchOutcome};
pub use history::{Completion, EntryResult, HistoryEntry, HistoryLedger, HistoryQuery};
pub use reader::{ReadOutcome, ResultReader};
