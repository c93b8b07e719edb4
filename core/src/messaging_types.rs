/// Shared types for the messaging core: identities, records, views and cursors
use crate::error::{MessagingError, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Placeholder rendered wherever a tombstoned (or purged) message is referenced
pub const DELETED_PLACEHOLDER: &str = "[deleted message]";

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Staff user id, as resolved by the external identity directory
    UserId
);
id_type!(ConversationId);
id_type!(MessageId);

// ─── Identity ────────────────────────────────────────────────────────────────

/// Staff role as reported by the identity directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Agent,
    Manager,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "agent" => Some(Role::Agent),
            "manager" => Some(Role::Manager),
            _ => None,
        }
    }
}

/// The authenticated user performing an operation. Always passed explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn agent(user_id: u64) -> Self {
        Self {
            user_id: UserId(user_id),
            role: Role::Agent,
        }
    }

    pub fn manager(user_id: u64) -> Self {
        Self {
            user_id: UserId(user_id),
            role: Role::Manager,
        }
    }

    /// Managers may delete any message and manage broadcast audiences
    pub fn is_privileged(&self) -> bool {
        self.role == Role::Manager
    }
}

// ─── Conversations ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Group,
    Broadcast,
    GuestRelated,
}

impl ConversationKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ConversationKind::Direct),
            "group" => Some(ConversationKind::Group),
            "broadcast" => Some(ConversationKind::Broadcast),
            "guest_related" => Some(ConversationKind::GuestRelated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Reference into the external guest records
    pub guest_id: Option<u64>,
    /// Sorted, unique
    pub participant_ids: Vec<UserId>,
    pub created_by: UserId,
    pub is_archived: bool,
    pub is_pinned: bool,
    /// Locked conversations accept no new messages
    pub is_locked: bool,
    pub created_at: DateTime<Utc>,
    /// Bumped on every new message
    pub last_activity_at: DateTime<Utc>,
    /// Bumped on any change visible in the conversation list
    pub updated_at: DateTime<Utc>,
    /// Highest sequence assigned so far (0 = empty)
    pub last_sequence: u64,
    /// Per-conversation change counter; every message mutation takes the next value
    pub revision: u64,
}

impl Conversation {
    pub fn has_participant(&self, user_id: UserId) -> bool {
        self.participant_ids.binary_search(&user_id).is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Admin,
    Member,
}

/// Membership of one user in one conversation, carrying the read watermark
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub last_read_sequence: u64,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewConversation {
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub guest_id: Option<u64>,
}

/// Partial update of conversation settings; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_archived: Option<bool>,
    #[serde(default)]
    pub is_pinned: Option<bool>,
    #[serde(default)]
    pub is_locked: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub include_archived: bool,
    pub kind: Option<ConversationKind>,
    pub pinned_only: bool,
    /// Case-insensitive substring over title, description and last message preview
    pub search: Option<String>,
}

/// List-view row for one conversation, from one user's point of view
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: u64,
    pub last_message: Option<MessagePreview>,
    pub my_role: ParticipantRole,
    pub my_last_read_sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPage {
    pub conversations: Vec<ConversationSummary>,
    /// Pass back as `cursor` to fetch the next page; absent on the last page
    pub next_cursor: Option<String>,
}

// ─── Messages ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    File,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    /// Dense, strictly increasing per conversation; never changes after append
    pub sequence: u64,
    /// Conversation revision of the last mutation touching this message
    pub revision: u64,
    pub sender_id: UserId,
    pub content: String,
    pub message_type: MessageType,
    pub attachment: Option<Attachment>,
    pub is_priority: bool,
    pub reply_to_message_id: Option<MessageId>,
    /// Client-chosen idempotency key for `send_message`
    pub client_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn preview(&self) -> MessagePreview {
        let content = if self.is_deleted() {
            DELETED_PLACEHOLDER.to_string()
        } else if self.content.is_empty() {
            self.attachment
                .as_ref()
                .map(|a| a.name.clone())
                .unwrap_or_default()
        } else {
            self.content.clone()
        };
        MessagePreview {
            message_id: self.id,
            sequence: self.sequence,
            sender_id: self.sender_id,
            content,
            is_deleted: self.is_deleted(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
    #[serde(default)]
    pub attachment: Option<Attachment>,
    #[serde(default)]
    pub is_priority: bool,
    #[serde(default)]
    pub client_message_id: Option<Uuid>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: MessageType::Text,
            reply_to_message_id: None,
            attachment: None,
            is_priority: false,
            client_message_id: None,
        }
    }

    pub fn reply(content: impl Into<String>, reply_to: MessageId) -> Self {
        Self {
            reply_to_message_id: Some(reply_to),
            ..Self::text(content)
        }
    }
}

/// Short rendering of a message, used for reply previews and list rows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub sequence: u64,
    pub sender_id: UserId,
    pub content: String,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

/// Reply reference as resolved at read time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplyPreview {
    pub message_id: MessageId,
    /// Absent once the target has been purged
    pub sequence: Option<u64>,
    pub sender_id: Option<UserId>,
    pub content: String,
    pub is_deleted: bool,
}

impl ReplyPreview {
    pub fn of(target: &Message) -> Self {
        let p = target.preview();
        Self {
            message_id: target.id,
            sequence: Some(target.sequence),
            sender_id: Some(target.sender_id),
            content: p.content,
            is_deleted: p.is_deleted,
        }
    }

    pub fn purged(message_id: MessageId) -> Self {
        Self {
            message_id,
            sequence: None,
            sender_id: None,
            content: DELETED_PLACEHOLDER.to_string(),
            is_deleted: true,
        }
    }
}

/// Aggregate of one reaction type on one message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReactionAggregate {
    pub reaction_type: String,
    /// Always equals `users.len()`
    pub count: u32,
    /// Sorted, unique
    pub users: Vec<UserId>,
}

impl ReactionAggregate {
    pub fn empty(reaction_type: &str) -> Self {
        Self {
            reaction_type: reaction_type.to_string(),
            count: 0,
            users: Vec::new(),
        }
    }

    /// Add the user if absent, remove if present
    pub fn toggle(&mut self, user_id: UserId) {
        match self.users.binary_search(&user_id) {
            Ok(pos) => {
                self.users.remove(pos);
            }
            Err(pos) => self.users.insert(pos, user_id),
        }
        self.count = self.users.len() as u32;
    }
}

/// A message as returned to clients: reply resolved, reactions attached
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub reply_to: Option<ReplyPreview>,
    pub reactions: Vec<ReactionAggregate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    /// Highest sequence in this page; pass as `since` on the next call
    pub next_since: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadState {
    pub conversation_id: ConversationId,
    pub last_read_sequence: u64,
    pub unread_count: u64,
}

// ─── Synchronization ─────────────────────────────────────────────────────────

/// Response to a conversation-list poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationDelta {
    /// Conversations changed since the cursor (may repeat already-seen ones)
    pub conversations: Vec<ConversationSummary>,
    /// Every conversation the caller currently belongs to; anything else was left
    pub member_of: Vec<ConversationId>,
    pub unread_counts: BTreeMap<ConversationId, u64>,
    pub cursor: String,
}

/// Response to an open-conversation poll
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDelta {
    pub conversation_id: ConversationId,
    /// New and changed messages, ordered by sequence
    pub messages: Vec<MessageView>,
    pub last_read_sequence: u64,
    pub unread_count: u64,
    /// More changes are pending; poll again immediately
    pub has_more: bool,
    pub cursor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagingStats {
    pub total_conversations: u64,
    pub unread_conversations: u64,
    pub messages_today: u64,
}

/// Position in the pinned-first, most-recent-first conversation list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListCursor {
    pub pinned: bool,
    pub last_activity_at: DateTime<Utc>,
    pub id: ConversationId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSyncCursor {
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageSyncCursor {
    pub revision: u64,
    pub sequence: u64,
}

/// Cursors are opaque to clients: URL-safe base64 over JSON
pub fn encode_cursor<T: Serialize>(cursor: &T) -> Result<String> {
    let json = serde_json::to_vec(cursor)?;
    Ok(general_purpose::URL_SAFE_NO_PAD.encode(json))
}

pub fn decode_cursor<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(raw.trim())
        .map_err(|e| MessagingError::InvalidCursor(format!("not base64: {}", e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| MessagingError::InvalidCursor(format!("malformed: {}", e)))
}
