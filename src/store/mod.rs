//! Chat domain layer: records, the remote API seam, the domain store and
//! the channel view-model

mod api;
mod domain;
mod types;
mod view;

pub use api::ChatApi;
pub use domain::{DomainStats, DomainStore};
pub use types::{
    Channel, ChannelId, HistoryRange, Message, MessageKey, MessagePageKey, Presence, Timestamp, User, UserId,
};
pub use view::ChannelViewModel;
