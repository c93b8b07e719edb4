/// Synchronization Engine: the client-facing protocol layer
///
/// Stateless per request. Reads take the client's cursor and return what
/// changed since then; mutations return the authoritative post-mutation
/// object. Nothing is cached between requests.
use crate::config::Config;
use crate::conversation_store::ConversationStore;
use crate::error::{MessagingError, Result};
use crate::message_store::MessageStore;
use crate::messaging_types::{
    decode_cursor, encode_cursor, Caller, Conversation, ConversationDelta, ConversationFilter, ConversationId,
    ConversationPage, ConversationSummary, ConversationSyncCursor, ConversationUpdate, ListCursor,
    MessageDelta, MessageId, MessagePage, MessageSyncCursor, MessageView, MessagingStats,
    NewConversation, NewMessage, Participant, ReadState, UserId,
};
use crate::storage::Storage;
use crate::unread::UnreadAccounting;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::time::Duration;
use tracing::{debug, info};

/// Engine knobs taken from `Config`
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub default_page_size: usize,
    pub max_page_size: usize,
    pub sync_overlap: Duration,
    pub tombstone_retention: Duration,
}

impl From<&Config> for SyncSettings {
    fn from(c: &Config) -> Self {
        Self {
            default_page_size: c.default_page_size,
            max_page_size: c.max_page_size,
            sync_overlap: c.sync_overlap,
            tombstone_retention: c.tombstone_retention,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings::from(&Config::default())
    }
}

impl SyncSettings {
    /// Clamp a client-supplied limit into `1..=max_page_size`
    fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size)
    }
}

#[derive(Clone)]
pub struct SyncEngine {
    storage: Storage,
    conversations: ConversationStore,
    messages: MessageStore,
    unread: UnreadAccounting,
    settings: SyncSettings,
}

impl SyncEngine {
    pub fn new(storage: Storage, settings: SyncSettings) -> Self {
        let conversations = ConversationStore::new(storage.clone());
        let messages = MessageStore::new(storage.clone());
        let unread = UnreadAccounting::new(conversations.clone(), messages.clone());
        Self {
            storage,
            conversations,
            messages,
            unread,
            settings,
        }
    }

    /// Open the store under `config.data_dir`
    pub fn open(config: &Config) -> Result<Self> {
        let storage = Storage::open(&config.data_dir)?;
        info!(
            "Sync engine ready: page size {} (max {}), list overlap {:?}",
            config.default_page_size, config.max_page_size, config.sync_overlap
        );
        Ok(Self::new(storage, SyncSettings::from(config)))
    }

    // ─── Conversations ───────────────────────────────────────────────────────

    pub fn create_conversation(&self, caller: &Caller, req: NewConversation) -> Result<ConversationSummary> {
        let conv = self.conversations.create_conversation(caller.user_id, req)?;
        self.unread.summarize(conv, caller.user_id)
    }

    pub fn get_conversation(&self, caller: &Caller, id: ConversationId) -> Result<ConversationSummary> {
        let conv = self.conversations.get(id)?;
        self.unread.summarize(conv, caller.user_id)
    }

    /// One page of the caller's conversation list. `cursor` is the
    /// `next_cursor` of the previous page.
    pub fn list_conversations(
        &self,
        caller: &Caller,
        filter: &ConversationFilter,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<ConversationPage> {
        let limit = self.settings.page_size(limit);
        let after: Option<ListCursor> = cursor.map(decode_cursor::<ListCursor>).transpose()?;
        let needle = filter
            .search
            .as_ref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let mut page = Vec::new();
        let mut next_cursor = None;
        for conv in self.conversations.list_conversations_for(caller.user_id, filter)? {
            if let Some(after) = &after {
                if !is_after(&conv, after) {
                    continue;
                }
            }
            let summary = self.unread.summarize(conv, caller.user_id)?;
            if let Some(needle) = &needle {
                if !matches_search(&summary, needle) {
                    continue;
                }
            }
            if page.len() == limit {
                let last: &ConversationSummary = &page[limit - 1];
                next_cursor = Some(encode_cursor(&ListCursor {
                    pinned: last.conversation.is_pinned,
                    last_activity_at: last.conversation.last_activity_at,
                    id: last.conversation.id,
                })?);
                break;
            }
            page.push(summary);
        }

        Ok(ConversationPage {
            conversations: page,
            next_cursor,
        })
    }

    pub fn update_conversation(
        &self,
        caller: &Caller,
        id: ConversationId,
        update: ConversationUpdate,
    ) -> Result<ConversationSummary> {
        let conv = self.conversations.update_conversation(id, caller, update)?;
        self.unread.summarize(conv, caller.user_id)
    }

    pub fn add_participants(
        &self,
        caller: &Caller,
        id: ConversationId,
        user_ids: &[UserId],
    ) -> Result<ConversationSummary> {
        let conv = self.conversations.add_participants(id, user_ids, caller)?;
        self.unread.summarize(conv, caller.user_id)
    }

    /// Membership rows with roles and read watermarks; participants only
    pub fn list_participants(&self, caller: &Caller, id: ConversationId) -> Result<Vec<Participant>> {
        self.conversations.require_participant(id, caller.user_id)?;
        self.conversations.participants(id)
    }

    /// Returns the updated conversation, or `None` when the caller removed themself
    pub fn remove_participant(
        &self,
        caller: &Caller,
        id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<ConversationSummary>> {
        let conv = self.conversations.remove_participant(id, user_id, caller)?;
        if user_id == caller.user_id {
            return Ok(None);
        }
        Ok(Some(self.unread.summarize(conv, caller.user_id)?))
    }

    pub fn mark_read(&self, caller: &Caller, id: ConversationId, up_to_sequence: u64) -> Result<ReadState> {
        let p = self.conversations.mark_read(id, caller.user_id, up_to_sequence)?;
        Ok(ReadState {
            conversation_id: id,
            last_read_sequence: p.last_read_sequence,
            unread_count: self.unread.unread_count(id, caller.user_id)?,
        })
    }

    pub fn messaging_stats(&self, caller: &Caller, now: DateTime<Utc>) -> Result<MessagingStats> {
        self.unread.messaging_stats(caller.user_id, now)
    }

    // ─── Messages ────────────────────────────────────────────────────────────

    pub fn list_messages(
        &self,
        caller: &Caller,
        id: ConversationId,
        since_sequence: Option<u64>,
        limit: Option<usize>,
    ) -> Result<MessagePage> {
        self.conversations.require_participant(id, caller.user_id)?;
        let limit = self.settings.page_size(limit);
        let messages = self
            .messages
            .list_messages(id, since_sequence, limit)?
            .collect::<Result<Vec<_>>>()?;
        let next_since = messages
            .last()
            .map(|v| v.message.sequence)
            .unwrap_or(since_sequence.unwrap_or(0));
        Ok(MessagePage {
            messages,
            next_since,
        })
    }

    pub fn send_message(&self, caller: &Caller, id: ConversationId, msg: NewMessage) -> Result<MessageView> {
        let m = self.messages.append_message(id, caller.user_id, msg)?;
        self.messages.view(m)
    }

    pub fn edit_message(&self, caller: &Caller, id: MessageId, content: &str) -> Result<MessageView> {
        let m = self.messages.edit_message(id, caller.user_id, content)?;
        self.messages.view(m)
    }

    pub fn delete_message(&self, caller: &Caller, id: MessageId) -> Result<MessageView> {
        let m = self.messages.delete_message(id, caller)?;
        self.messages.view(m)
    }

    /// Toggle a reaction; returns the message with its updated aggregates
    pub fn react(&self, caller: &Caller, id: MessageId, reaction_type: &str) -> Result<MessageView> {
        self.messages.react(id, caller.user_id, reaction_type)?;
        let m = self.messages.get_message(id)?;
        self.messages.view(m)
    }

    // ─── Polling ─────────────────────────────────────────────────────────────

    /// Conversation-list poll. Without a cursor every conversation is returned.
    pub fn sync_conversations(&self, caller: &Caller, cursor: Option<&str>) -> Result<ConversationDelta> {
        let now = Utc::now();
        let since = match cursor {
            Some(raw) => {
                let c: ConversationSyncCursor = decode_cursor(raw)?;
                let overlap = chrono::Duration::from_std(self.settings.sync_overlap)
                    .map_err(|e| MessagingError::Config(e.to_string()))?;
                Some(c.since - overlap)
            }
            None => None,
        };

        let everything = ConversationFilter {
            include_archived: true,
            ..Default::default()
        };
        let all = self.conversations.list_conversations_for(caller.user_id, &everything)?;

        let mut conversations = Vec::new();
        let mut member_of = Vec::with_capacity(all.len());
        for conv in all {
            member_of.push(conv.id);
            if since.map_or(true, |s| conv.updated_at > s) {
                conversations.push(self.unread.summarize(conv, caller.user_id)?);
            }
        }
        let unread_counts = self.unread.unread_counts(caller.user_id)?;

        debug!(
            "User {} conversation sync: {} changed of {}",
            caller.user_id,
            conversations.len(),
            member_of.len()
        );
        Ok(ConversationDelta {
            conversations,
            member_of,
            unread_counts,
            cursor: encode_cursor(&ConversationSyncCursor { since: now })?,
        })
    }

    /// Open-conversation poll. Without a cursor this is the initial load (the
    /// most recent page); with one, every message created, edited, deleted or
    /// reacted to since.
    pub fn sync_messages(&self, caller: &Caller, id: ConversationId, cursor: Option<&str>) -> Result<MessageDelta> {
        let me = self.conversations.require_participant(id, caller.user_id)?;
        let limit = self.settings.max_page_size;

        let (messages, revision, has_more) = match cursor {
            Some(raw) => {
                let c: MessageSyncCursor = decode_cursor(raw)?;
                let changes = self.messages.changed_since(id, c.revision, limit)?;
                (changes.messages, changes.revision, changes.has_more)
            }
            None => {
                // read the revision first: anything racing the load shows up next poll
                let revision = self.conversations.get(id)?.revision;
                let page = self
                    .messages
                    .list_messages(id, None, self.settings.default_page_size)?
                    .collect::<Result<Vec<_>>>()?;
                (page, revision, false)
            }
        };

        let sequence = messages.iter().map(|v| v.message.sequence).max().unwrap_or(0);
        let unread_count = self.unread.unread_count(id, caller.user_id)?;
        Ok(MessageDelta {
            conversation_id: id,
            messages,
            last_read_sequence: me.last_read_sequence,
            unread_count,
            has_more,
            cursor: encode_cursor(&MessageSyncCursor { revision, sequence })?,
        })
    }

    // ─── Maintenance ─────────────────────────────────────────────────────────

    /// Remove tombstones older than the retention window as of `now`
    pub fn purge_expired_tombstones(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.settings.tombstone_retention)
            .map_err(|e| MessagingError::Config(e.to_string()))?;
        match now.checked_sub_signed(retention) {
            Some(cutoff) => self.messages.purge_expired_tombstones(cutoff),
            // the window reaches past the earliest representable time
            None => Ok(0),
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.storage.flush()
    }
}

/// Strictly after `cursor` in list order
fn is_after(conv: &Conversation, cursor: &ListCursor) -> bool {
    (!conv.is_pinned, Reverse(conv.last_activity_at), Reverse(conv.id))
        > (!cursor.pinned, Reverse(cursor.last_activity_at), Reverse(cursor.id))
}

fn matches_search(summary: &ConversationSummary, needle: &str) -> bool {
    let hit = |s: &Option<String>| s.as_ref().is_some_and(|s| s.to_lowercase().contains(needle));
    hit(&summary.conversation.title)
        || hit(&summary.conversation.description)
        || summary
            .last_message
            .as_ref()
            .is_some_and(|m| m.content.to_lowercase().contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging_types::{ConversationKind, DELETED_PLACEHOLDER};
    use tempfile::TempDir;

    fn engine() -> (TempDir, SyncEngine) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let settings = SyncSettings {
            default_page_size: 2,
            max_page_size: 3,
            ..Default::default()
        };
        (dir, SyncEngine::new(storage, settings))
    }

    fn group(title: &str, ids: &[u64]) -> NewConversation {
        NewConversation {
            kind: ConversationKind::Group,
            participant_ids: ids.iter().map(|i| UserId(*i)).collect(),
            title: Some(title.to_string()),
            description: None,
            guest_id: None,
        }
    }

    #[test]
    fn test_list_pages_with_cursor() {
        let (_dir, engine) = engine();
        let a = Caller::agent(1);
        for t in ["Lobby", "Spa", "Kitchen", "Valet"] {
            engine.create_conversation(&a, group(t, &[2])).unwrap();
        }

        let first = engine
            .list_conversations(&a, &ConversationFilter::default(), None, None)
            .unwrap();
        assert_eq!(first.conversations.len(), 2);
        let cursor = first.next_cursor.expect("more pages");

        let second = engine
            .list_conversations(&a, &ConversationFilter::default(), Some(&cursor), Some(3))
            .unwrap();
        assert_eq!(second.conversations.len(), 2);
        assert!(second.next_cursor.is_none());

        let mut seen: Vec<_> = first
            .conversations
            .iter()
            .chain(second.conversations.iter())
            .map(|s| s.conversation.id)
            .collect();
        seen.dedup();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_search_matches_title_and_last_message() {
        let (_dir, engine) = engine();
        let a = Caller::agent(1);
        engine.create_conversation(&a, group("Pool area", &[2])).unwrap();
        let other = engine.create_conversation(&a, group("Night audit", &[2])).unwrap();
        engine
            .send_message(&a, other.conversation.id, NewMessage::text("Pool towels restocked"))
            .unwrap();

        let filter = ConversationFilter {
            search: Some("POOL".to_string()),
            ..Default::default()
        };
        let page = engine.list_conversations(&a, &filter, None, Some(10)).unwrap();
        assert_eq!(page.conversations.len(), 2);

        let filter = ConversationFilter {
            search: Some("audit".to_string()),
            ..Default::default()
        };
        let page = engine.list_conversations(&a, &filter, None, Some(10)).unwrap();
        assert_eq!(page.conversations.len(), 1);
    }

    #[test]
    fn test_outsiders_cannot_read_messages() {
        let (_dir, engine) = engine();
        let conv = engine
            .create_conversation(&Caller::agent(1), group("Ops", &[2]))
            .unwrap();
        let err = engine
            .list_messages(&Caller::agent(3), conv.conversation.id, None, None)
            .unwrap_err();
        assert!(matches!(err, MessagingError::NotAuthorized(_)));
        let err = engine
            .sync_messages(&Caller::agent(3), conv.conversation.id, None)
            .unwrap_err();
        assert!(matches!(err, MessagingError::NotAuthorized(_)));
    }

    #[test]
    fn test_message_sync_picks_up_remote_changes() {
        let (_dir, engine) = engine();
        let a = Caller::agent(1);
        let b = Caller::agent(2);
        let id = engine.create_conversation(&a, group("Ops", &[2])).unwrap().conversation.id;
        let first = engine.send_message(&a, id, NewMessage::text("one")).unwrap();

        let initial = engine.sync_messages(&b, id, None).unwrap();
        assert_eq!(initial.messages.len(), 1);
        assert_eq!(initial.unread_count, 1);

        engine.send_message(&a, id, NewMessage::text("two")).unwrap();
        engine.edit_message(&a, first.message.id, "one (edited)").unwrap();

        let delta = engine.sync_messages(&b, id, Some(&initial.cursor)).unwrap();
        let contents: Vec<_> = delta.messages.iter().map(|v| v.message.content.as_str()).collect();
        assert_eq!(contents, vec!["one (edited)", "two"]);

        // polling again with the new cursor is empty and idempotent
        let again = engine.sync_messages(&b, id, Some(&delta.cursor)).unwrap();
        assert!(again.messages.is_empty());
        let again2 = engine.sync_messages(&b, id, Some(&delta.cursor)).unwrap();
        assert!(again2.messages.is_empty());
    }

    #[test]
    fn test_message_sync_resends_replies_when_target_is_deleted() {
        let (_dir, engine) = engine();
        let (a, b, c) = (Caller::agent(1), Caller::agent(2), Caller::agent(3));
        let id = engine.create_conversation(&a, group("Handover", &[2, 3])).unwrap().conversation.id;
        let towels = engine.send_message(&a, id, NewMessage::text("Room 204 needs towels")).unwrap();
        engine
            .send_message(&b, id, NewMessage::reply("On it", towels.message.id))
            .unwrap();

        let initial = engine.sync_messages(&c, id, None).unwrap();
        assert_eq!(initial.messages[1].reply_to.as_ref().unwrap().content, "Room 204 needs towels");

        engine.delete_message(&a, towels.message.id).unwrap();

        let delta = engine.sync_messages(&c, id, Some(&initial.cursor)).unwrap();
        let seqs: Vec<u64> = delta.messages.iter().map(|v| v.message.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(delta.messages[0].message.is_deleted());
        let preview = delta.messages[1].reply_to.as_ref().unwrap();
        assert!(preview.is_deleted);
        assert_eq!(preview.content, DELETED_PLACEHOLDER);
    }

    #[test]
    fn test_message_sync_resends_replies_when_target_is_edited() {
        let (_dir, engine) = engine();
        let (a, b) = (Caller::agent(1), Caller::agent(2));
        let id = engine.create_conversation(&a, group("Laundry", &[2])).unwrap().conversation.id;
        let target = engine.send_message(&a, id, NewMessage::text("Linen at 9")).unwrap();
        engine
            .send_message(&b, id, NewMessage::reply("Got it", target.message.id))
            .unwrap();
        let initial = engine.sync_messages(&b, id, None).unwrap();

        engine.edit_message(&a, target.message.id, "Linen at 10").unwrap();

        let delta = engine.sync_messages(&b, id, Some(&initial.cursor)).unwrap();
        assert_eq!(delta.messages.len(), 2);
        assert_eq!(delta.messages[0].message.content, "Linen at 10");
        assert_eq!(delta.messages[1].reply_to.as_ref().unwrap().content, "Linen at 10");

        let again = engine.sync_messages(&b, id, Some(&delta.cursor)).unwrap();
        assert!(again.messages.is_empty());
    }

    #[test]
    fn test_message_sync_pages_large_backlogs() {
        let (_dir, engine) = engine();
        let a = Caller::agent(1);
        let id = engine.create_conversation(&a, group("Ops", &[2])).unwrap().conversation.id;
        let start = engine.sync_messages(&a, id, None).unwrap();
        for i in 0..5 {
            engine.send_message(&a, id, NewMessage::text(format!("n{}", i))).unwrap();
        }

        let d1 = engine.sync_messages(&a, id, Some(&start.cursor)).unwrap();
        assert_eq!(d1.messages.len(), 3);
        assert!(d1.has_more);
        let d2 = engine.sync_messages(&a, id, Some(&d1.cursor)).unwrap();
        assert_eq!(d2.messages.len(), 2);
        assert!(!d2.has_more);
        assert_eq!(d2.messages[1].message.sequence, 5);
    }

    #[test]
    fn test_conversation_sync_reports_changes_and_membership() {
        let (_dir, engine) = engine();
        let a = Caller::agent(1);
        let b = Caller::agent(2);
        let quiet = engine.create_conversation(&a, group("Quiet", &[2])).unwrap().conversation.id;
        let busy = engine.create_conversation(&a, group("Busy", &[2])).unwrap().conversation.id;

        let initial = engine.sync_conversations(&b, None).unwrap();
        assert_eq!(initial.conversations.len(), 2);
        assert_eq!(initial.member_of.len(), 2);

        engine.send_message(&a, busy, NewMessage::text("ping")).unwrap();
        let delta = engine.sync_conversations(&b, Some(&initial.cursor)).unwrap();
        assert!(delta.conversations.iter().any(|s| s.conversation.id == busy));
        assert_eq!(delta.unread_counts.get(&busy), Some(&1));
        assert_eq!(delta.unread_counts.get(&quiet), Some(&0));

        engine.remove_participant(&b, quiet, UserId(2)).unwrap();
        let after_leave = engine.sync_conversations(&b, Some(&delta.cursor)).unwrap();
        assert_eq!(after_leave.member_of, vec![busy]);
    }

    #[test]
    fn test_participants_are_visible_to_members_only() {
        let (_dir, engine) = engine();
        let a = Caller::agent(1);
        let id = engine.create_conversation(&a, group("Ops", &[2, 3])).unwrap().conversation.id;
        let members = engine.list_participants(&Caller::agent(3), id).unwrap();
        let ids: Vec<_> = members.iter().map(|p| p.user_id).collect();
        assert_eq!(ids, vec![UserId(1), UserId(2), UserId(3)]);

        let err = engine.list_participants(&Caller::agent(4), id).unwrap_err();
        assert!(matches!(err, MessagingError::NotAuthorized(_)));
    }

    #[test]
    fn test_mark_read_returns_read_state() {
        let (_dir, engine) = engine();
        let a = Caller::agent(1);
        let b = Caller::agent(2);
        let id = engine.create_conversation(&a, group("Ops", &[2])).unwrap().conversation.id;
        for i in 0..3 {
            engine.send_message(&a, id, NewMessage::text(format!("m{}", i))).unwrap();
        }
        let state = engine.mark_read(&b, id, 2).unwrap();
        assert_eq!(state.last_read_sequence, 2);
        assert_eq!(state.unread_count, 1);

        let stale = engine.mark_read(&b, id, 1).unwrap();
        assert_eq!(stale.last_read_sequence, 2);
        assert_eq!(stale.unread_count, 1);
    }

    #[test]
    fn test_bad_cursor_is_rejected() {
        let (_dir, engine) = engine();
        let a = Caller::agent(1);
        let id = engine.create_conversation(&a, group("Ops", &[2])).unwrap().conversation.id;
        let err = engine.sync_messages(&a, id, Some("not-a-cursor")).unwrap_err();
        assert!(matches!(err, MessagingError::InvalidCursor(_)));
        let err = engine.sync_conversations(&a, Some("@@")).unwrap_err();
        assert!(matches!(err, MessagingError::InvalidCursor(_)));
    }
}
