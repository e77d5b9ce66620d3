//! Chat domain records and their keys
//!
//! Channels and users are partial records: a remote event may carry only
//! the fields that changed, so every descriptive field is optional and
//! records merge field by field. Fields serialized with a leading `_` are
//! local-only and never persisted.

use crate::persist::StoreKey;
use crate::reactive::{merge_field, Merge};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Identifiers
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn from_secs(secs: i64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    pub fn as_millis(self) -> i64 {
        self.0
    }

    /// Index of the page of width `window_secs` this timestamp falls in.
    /// Floors, so pre-epoch timestamps land in negative pages.
    pub fn page(self, window_secs: i64) -> i64 {
        self.0.div_euclid(window_millis(window_secs))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn window_millis(window_secs: i64) -> i64 {
    window_secs.max(1).saturating_mul(1000)
}

// =============================================================================
// Cache keys
// =============================================================================

/// Identifies one message: its channel and its timestamp
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub channel: ChannelId,
    pub ts: Timestamp,
}

impl MessageKey {
    pub fn new(channel: impl Into<ChannelId>, ts: Timestamp) -> Self {
        Self {
            channel: channel.into(),
            ts,
        }
    }

    pub fn store_key(&self) -> StoreKey {
        StoreKey::message(self.channel.as_str(), self.ts.as_millis())
    }

    pub fn page(&self, window_secs: i64) -> MessagePageKey {
        MessagePageKey {
            channel: self.channel.clone(),
            page: self.ts.page(window_secs),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.channel, self.ts)
    }
}

/// One fixed-width time window of a channel's history
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessagePageKey {
    pub channel: ChannelId,
    pub page: i64,
}

impl MessagePageKey {
    pub fn new(channel: impl Into<ChannelId>, page: i64) -> Self {
        Self {
            channel: channel.into(),
            page,
        }
    }

    /// Half-open `[from, to)` bounds of the page in milliseconds
    pub fn bounds(&self, window_secs: i64) -> (i64, i64) {
        let width = window_millis(window_secs);
        let from = self.page.saturating_mul(width);
        (from, from.saturating_add(width))
    }

    pub fn range(&self, window_secs: i64) -> HistoryRange {
        let (from, to) = self.bounds(window_secs);
        HistoryRange::new(Timestamp(from), Timestamp(to))
    }

    pub fn contains(&self, key: &MessageKey, window_secs: i64) -> bool {
        key.channel == self.channel && key.ts.page(window_secs) == self.page
    }
}

impl fmt::Display for MessagePageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.channel, self.page)
    }
}

/// Half-open time range `[from, to)` of a history request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRange {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl HistoryRange {
    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        Self { from, to }
    }

    /// The range holding exactly `ts`
    pub fn at(ts: Timestamp) -> Self {
        Self::new(ts, Timestamp(ts.0.saturating_add(1)))
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        (self.from..self.to).contains(&ts)
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<UserId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_archived: Option<bool>,
    /// Users currently typing; local-only
    #[serde(rename = "_typing", default, skip_serializing_if = "Option::is_none")]
    pub typing: Option<Vec<UserId>>,
}

impl Channel {
    pub fn new(id: impl Into<ChannelId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn named(id: impl Into<ChannelId>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(id)
        }
    }

    /// `#name`, the id when the name is unknown, with an archived marker
    pub fn display_title(&self) -> String {
        let name = self.name.as_deref().unwrap_or(self.id.as_str());
        if self.is_archived == Some(true) {
            format!("#{name} (archived)")
        } else {
            format!("#{name}")
        }
    }
}

impl Merge for Channel {
    fn merge_from(&mut self, update: Self) {
        merge_field(&mut self.name, update.name);
        merge_field(&mut self.topic, update.topic);
        merge_field(&mut self.members, update.members);
        merge_field(&mut self.is_archived, update.is_archived);
        merge_field(&mut self.typing, update.typing);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Active,
    Away,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    /// Live presence; local-only
    #[serde(rename = "_presence", default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
}

impl User {
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn named(id: impl Into<UserId>, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(id)
        }
    }
}

impl Merge for User {
    fn merge_from(&mut self, update: Self) {
        merge_field(&mut self.name, update.name);
        merge_field(&mut self.real_name, update.real_name);
        merge_field(&mut self.avatar_url, update.avatar_url);
        merge_field(&mut self.presence, update.presence);
    }
}

/// A chat message. Messages are immutable apart from edits, so message
/// cells overwrite rather than merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub channel: ChannelId,
    pub ts: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserId>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited: Option<Timestamp>,
    /// Sent locally, not yet acknowledged
    #[serde(rename = "_pending", default, skip_serializing_if = "std::ops::Not::not")]
    pub pending: bool,
}

impl Message {
    pub fn new(channel: impl Into<ChannelId>, ts: Timestamp, text: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            ts,
            user: None,
            text: text.into(),
            edited: None,
            pending: false,
        }
    }

    pub fn from_user(mut self, user: impl Into<UserId>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::new(self.channel.clone(), self.ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::strip_transient;
    use serde_json::json;

    #[test]
    fn test_partial_updates_start_from_default() {
        let update = Channel {
            topic: Some("launch".into()),
            ..Channel::default()
        };
        assert_eq!(update.id, ChannelId::default());
        assert_eq!(update.id.as_str(), "");
        assert_eq!(User::default().id, UserId::new(""));
    }

    #[test]
    fn test_page_floors() {
        let day = 86_400;
        assert_eq!(Timestamp::from_secs(0).page(day), 0);
        assert_eq!(Timestamp::from_secs(day - 1).page(day), 0);
        assert_eq!(Timestamp::from_secs(day).page(day), 1);
        assert_eq!(Timestamp::from_millis(-1).page(day), -1);
    }

    #[test]
    fn test_page_bounds_cover_members() {
        let window = 60;
        let key = MessageKey::new("c1", Timestamp::from_millis(125_000));
        let page = key.page(window);
        assert_eq!(page, MessagePageKey::new("c1", 2));
        assert_eq!(page.bounds(window), (120_000, 180_000));
        assert!(page.contains(&key, window));
        assert!(page.range(window).contains(key.ts));
        assert!(!page.contains(&MessageKey::new("c2", key.ts), window));
    }

    #[test]
    fn test_channel_merge_keeps_absent_fields() {
        let mut channel = Channel {
            topic: Some("standup".into()),
            ..Channel::named("c1", "general")
        };
        channel.merge_from(Channel {
            is_archived: Some(true),
            ..Channel::new("c1")
        });
        assert_eq!(channel.name.as_deref(), Some("general"));
        assert_eq!(channel.topic.as_deref(), Some("standup"));
        assert_eq!(channel.display_title(), "#general (archived)");
    }

    #[test]
    fn test_transient_fields_serialize_with_underscore() {
        let user = User {
            presence: Some(Presence::Away),
            ..User::named("u1", "ada")
        };
        let value = serde_json::to_value(&user).unwrap();
        assert_eq!(value["_presence"], json!("away"));
        assert_eq!(strip_transient(&value), json!({"id": "u1", "name": "ada"}));

        let restored: User = serde_json::from_value(strip_transient(&value)).unwrap();
        assert_eq!(restored.presence, None);
    }

    #[test]
    fn test_pending_message_flag() {
        let mut message = Message::new("c1", Timestamp(5), "hi");
        assert!(serde_json::to_value(&message).unwrap().get("_pending").is_none());
        message.pending = true;
        assert_eq!(serde_json::to_value(&message).unwrap()["_pending"], json!(true));
    }
}
