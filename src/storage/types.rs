use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance appears to be using the database. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Channel id does not exist
    #[error("Channel {0} not found")]
    ChannelNotFound(i64),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Id of the category that always exists and receives orphaned channels.
pub const DEFAULT_CATEGORY_ID: i64 = 0;

/// How an item of the channel is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelAction {
    /// Show the item link in the built-in viewer
    #[default]
    ViewLink,
    /// Show the enclosure in the built-in viewer
    ViewEnclosure,
    /// Hand the item link to an external application
    OpenLink,
    /// Hand the enclosure to an external application
    OpenEnclosure,
}

impl ChannelAction {
    pub fn targets_enclosure(self) -> bool {
        matches!(self, ChannelAction::ViewEnclosure | ChannelAction::OpenEnclosure)
    }

    pub(crate) fn to_db(self) -> i64 {
        match self {
            ChannelAction::ViewLink => 0,
            ChannelAction::ViewEnclosure => 1,
            ChannelAction::OpenLink => 2,
            ChannelAction::OpenEnclosure => 3,
        }
    }

    pub(crate) fn from_db(value: i64) -> Self {
        match value {
            1 => ChannelAction::ViewEnclosure,
            2 => ChannelAction::OpenLink,
            3 => ChannelAction::OpenEnclosure,
            _ => ChannelAction::ViewLink,
        }
    }
}

/// Display order of a channel's items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemOrder {
    /// Feed order (feeds list newest first)
    #[default]
    Newest,
    /// Reverse feed order
    Oldest,
}

impl ItemOrder {
    pub(crate) fn to_db(self) -> i64 {
        match self {
            ItemOrder::Newest => 0,
            ItemOrder::Oldest => 1,
        }
    }

    pub(crate) fn from_db(value: i64) -> Self {
        if value == 1 {
            ItemOrder::Oldest
        } else {
            ItemOrder::Newest
        }
    }
}

/// Subscribed feed source and its metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    /// Icon bytes as downloaded
    pub image: Option<Vec<u8>>,
    pub action: ChannelAction,
    pub order: ItemOrder,
    /// Unix seconds of the last successful sync
    pub last_update: Option<i64>,
    pub category_id: i64,
}

/// Fields rewritten by a successful sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMeta {
    pub title: String,
    pub description: Option<String>,
    /// `None` keeps the stored icon.
    pub image: Option<Vec<u8>>,
    pub last_update: i64,
}

/// User preferences of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelPrefs {
    pub action: ChannelAction,
    pub order: ItemOrder,
    /// `None` selects [`DEFAULT_CATEGORY_ID`].
    pub category_id: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ChannelDbRow {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub image: Option<Vec<u8>>,
    pub action: i64,
    pub item_order: i64,
    pub last_update: Option<i64>,
    pub category_id: i64,
}

impl ChannelDbRow {
    pub(crate) fn into_channel(self) -> Channel {
        Channel {
            id: self.id,
            url: self.url,
            title: self.title,
            description: self.description,
            image: self.image,
            action: ChannelAction::from_db(self.action),
            order: ItemOrder::from_db(self.item_order),
            last_update: self.last_update,
            category_id: self.category_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Category {
    pub id: i64,
    pub name: String,
}

// ============================================================================
// Item
// ============================================================================

/// Reading state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemState {
    #[default]
    New,
    Read,
    Opened,
}

impl ItemState {
    pub(crate) fn to_db(self) -> i64 {
        match self {
            ItemState::New => 0,
            ItemState::Read => 1,
            ItemState::Opened => 2,
        }
    }

    pub(crate) fn from_db(value: i64) -> Self {
        match value {
            1 => ItemState::Read,
            2 => ItemState::Opened,
            _ => ItemState::New,
        }
    }
}

/// One stored entry of a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Unique across all channels
    pub id: i64,
    pub channel_id: i64,
    pub title: String,
    pub description: Option<String>,
    pub link: Option<String>,
    pub enclosure_url: Option<String>,
    pub enclosure_length: Option<i64>,
    pub enclosure_type: Option<String>,
    /// Raw date string as found in the feed
    pub pub_date: Option<String>,
    pub state: ItemState,
    /// Enclosure has been downloaded to the local cache
    pub downloaded: bool,
}

/// A single-item mutation that may be deferred while its channel syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemUpdate {
    State(ItemState),
    Downloaded(bool),
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemDbRow {
    pub id: i64,
    pub title: String,
    pub description: Option<String>,
    pub link: Option<String>,
    pub enclosure_url: Option<String>,
    pub enclosure_length: Option<i64>,
    pub enclosure_type: Option<String>,
    pub pub_date: Option<String>,
    pub state: i64,
    pub downloaded: bool,
}

impl ItemDbRow {
    pub(crate) fn into_item(self, channel_id: i64) -> Item {
        Item {
            id: self.id,
            channel_id,
            title: self.title,
            description: self.description,
            link: self.link,
            enclosure_url: self.enclosure_url,
            enclosure_length: self.enclosure_length,
            enclosure_type: self.enclosure_type,
            pub_date: self.pub_date,
            state: ItemState::from_db(self.state),
            downloaded: self.downloaded,
        }
    }
}

/// Which of a channel's two item tables an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemArea {
    /// `items_<channelId>`: the committed, visible set
    Live(i64),
    /// `items_temp_<channelId>`: the set being built by a sync
    Staging(i64),
}

impl ItemArea {
    pub fn table_name(self) -> String {
        match self {
            ItemArea::Live(channel_id) => format!("items_{channel_id}"),
            ItemArea::Staging(channel_id) => format!("items_temp_{channel_id}"),
        }
    }
}
