//! Core data model definitions shared across dray crates.
#![allow(missing_docs)]

pub mod error;
pub mod exit_code;
pub mod message;
pub mod priority;
pub mod protocol;
pub mod status;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use exit_code::{classify_exit, ExitDisposition, WorkerExit};
pub use message::{MsgName, Originator, TransferMessage, MSG_BLOCK_LENGTH};
pub use priority::{decay, msg_number, retrieve_msg_number, RETRY_THRESHOLD};
pub use protocol::Protocol;
pub use status::{
    ConnectStatus, AUTO_PAUSE_QUEUE_LOCK_STAT, AUTO_PAUSE_QUEUE_STAT,
    HOST_DISABLED, STOP_TRANSFER_STAT,
};
