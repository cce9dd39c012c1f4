//! Failure taxonomy shared by jobs, the task runtime and observers.

use thiserror::Error;

use crate::feed::ParseError;
use crate::net::LoadError;
use crate::storage::DatabaseError;
use crate::sync::SyncError;

/// Coarse failure class reported to task observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Cancellation observed without a user request (engine shutdown)
    Interrupted,
    /// Explicit `cancel` call
    UserCancelled,
    /// Transport failure after retries were exhausted
    Network,
    UnsupportedFormat,
    UnsupportedVersion,
    /// Malformed XML or a channel without a title
    InvalidFeed,
    /// Staging, commit or another storage step failed
    StorageUnknown,
    /// The target is gone or there is nothing to fetch for it
    Unavailable,
    /// The job panicked
    Panicked,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::UserCancelled => "cancelled",
            ErrorKind::Network => "network error",
            ErrorKind::UnsupportedFormat => "unsupported format",
            ErrorKind::UnsupportedVersion => "unsupported version",
            ErrorKind::InvalidFeed => "invalid feed",
            ErrorKind::StorageUnknown => "storage error",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Panicked => "internal error",
        };
        f.write_str(s)
    }
}

/// Error returned by a job's `run`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Storage(#[from] DatabaseError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Channel {0} not found")]
    ChannelNotFound(i64),
    #[error("Item {item_id} not found in channel {channel_id}")]
    ItemNotFound { channel_id: i64, item_id: i64 },
    #[error("Item {0} has nothing to download")]
    NothingToDownload(i64),
    #[error("No download directory configured")]
    DownloadsDisabled,
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Load(LoadError::Cancelled) => ErrorKind::Interrupted,
            JobError::Load(LoadError::Io(_)) => ErrorKind::StorageUnknown,
            JobError::Load(_) => ErrorKind::Network,
            JobError::Parse(ParseError::Interrupted) => ErrorKind::Interrupted,
            JobError::Parse(ParseError::UnsupportedFormat(_)) => ErrorKind::UnsupportedFormat,
            JobError::Parse(ParseError::UnsupportedVersion(_)) => ErrorKind::UnsupportedVersion,
            JobError::Parse(ParseError::InvalidChannel | ParseError::Xml(_)) => {
                ErrorKind::InvalidFeed
            }
            JobError::Sync(SyncError::Interrupted) => ErrorKind::Interrupted,
            JobError::Sync(SyncError::Storage(DatabaseError::ChannelNotFound(_))) => {
                ErrorKind::Unavailable
            }
            JobError::Sync(_) | JobError::Storage(_) | JobError::Io(_) => {
                ErrorKind::StorageUnknown
            }
            JobError::ChannelNotFound(_)
            | JobError::ItemNotFound { .. }
            | JobError::NothingToDownload(_)
            | JobError::DownloadsDisabled => ErrorKind::Unavailable,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.kind() == ErrorKind::Interrupted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_maps_to_interrupted() {
        assert!(JobError::from(LoadError::Cancelled).is_interrupted());
        assert!(JobError::from(ParseError::Interrupted).is_interrupted());
        assert!(JobError::from(SyncError::Interrupted).is_interrupted());
    }

    #[test]
    fn test_parse_errors_keep_their_class() {
        assert_eq!(
            JobError::from(ParseError::UnsupportedVersion("1.0".into())).kind(),
            ErrorKind::UnsupportedVersion
        );
        assert_eq!(
            JobError::from(ParseError::UnsupportedFormat("html".into())).kind(),
            ErrorKind::UnsupportedFormat
        );
        assert_eq!(
            JobError::from(ParseError::InvalidChannel).kind(),
            ErrorKind::InvalidFeed
        );
    }

    #[test]
    fn test_transport_and_storage_classes() {
        assert_eq!(JobError::from(LoadError::Timeout).kind(), ErrorKind::Network);
        assert_eq!(
            JobError::from(LoadError::HttpStatus(503)).kind(),
            ErrorKind::Network
        );
        assert_eq!(
            JobError::from(SyncError::AlreadyUpdating(1)).kind(),
            ErrorKind::StorageUnknown
        );
        assert_eq!(
            JobError::ItemNotFound {
                channel_id: 1,
                item_id: 2
            }
            .kind(),
            ErrorKind::Unavailable
        );
    }
}
