//! # dray-core
//!
//! Scheduler-core state for the dray file distribution daemon.
//!
//! Everything the transfer scheduler mutates lives here: the persistent
//! priority queue and message cache (memory-mapped, restart-safe), the
//! host and retrieve-directory status areas shared with the job
//! generator and the operator UI, the in-memory connection table, and
//! the small pure helpers around them (rate-limit groups, retrieve
//! timetables, spool layout).
//!
//! The crate performs no process management and opens no fifos; that is
//! the daemon's job. It owns the data invariants instead: queue
//! ordering, the queue/cache/host-counter bookkeeping, and the
//! word-offset header contract of every mapped file.

pub mod cache;
pub mod connection;
pub mod error;
pub mod fra;
pub mod fsa;
pub mod mapped;
pub mod queue;
pub mod spool;
pub mod status;
pub mod timetable;
pub mod trl;

pub use cache::{CacheEntry, JobIdRecord, JobIdTable, MsgCache};
pub use connection::{Connection, ConnectionTable};
pub use error::{CoreError, Result};
pub use fra::{RetrieveArea, RetrieveDir};
pub use fsa::{HostStatusArea, HostStatus, JobSlot, MAX_NO_PARALLEL_JOBS};
pub use queue::{QueueBuffer, QueueEntry, QueueSlot};
pub use status::{DaemonStatus, StatusArea};
