mod categories;
mod channels;
mod items;
mod schema;
mod store;
mod types;

pub use schema::Database;
pub use store::ItemStore;
pub use types::{
    Category, Channel, ChannelAction, ChannelMeta, ChannelPrefs, DatabaseError, Item, ItemArea,
    ItemOrder, ItemState, ItemUpdate, DEFAULT_CATEGORY_ID,
};
