//! Channel synchronization: the staging-table reconciler and the two
//! background jobs built on it.

mod jobs;
mod reconcile;

pub use jobs::{ChannelUpdateJob, ItemDownloadJob};
pub use reconcile::{Reconciler, SyncError, SyncReport, WriteOutcome};
