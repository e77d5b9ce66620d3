//! Remote chat service seam

use super::types::{Channel, ChannelId, HistoryRange, Message, User, UserId};
use crate::error::Result;
use async_trait::async_trait;

/// Remote source of truth for chat records.
///
/// Implementations own transport, authentication and retries. A missing
/// record is `StoreError::NotFound`; transport failures are
/// `StoreError::Network`.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn channel_info(&self, id: &ChannelId) -> Result<Channel>;

    async fn user_info(&self, id: &UserId) -> Result<User>;

    /// Messages of `channel` with timestamps in `range`, in any order.
    async fn message_history(&self, channel: &ChannelId, range: HistoryRange) -> Result<Vec<Message>>;
}
