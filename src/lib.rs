//! Feed synchronization engine.
//!
//! Fetches RSS 2.0 and Atom documents, reduces them to a normalized
//! channel, swaps the stored item set atomically and runs updates and
//! downloads as cancelable background tasks, one per channel or item.
//!
//! [`SyncEngine`] is the entry point; the modules below are its parts.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod feed;
pub mod net;
pub mod storage;
pub mod sync;
pub mod task;
pub mod util;

pub use config::Config;
pub use engine::{ImportSummary, SyncEngine};
pub use error::{ErrorKind, JobError};
pub use task::{TaskKey, TaskOutcome, TaskState};
