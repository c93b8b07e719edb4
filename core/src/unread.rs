/// Unread/notification accounting, recomputed on every read
/// Frugal: no counters to drift; conversation volumes are small.
use crate::conversation_store::{not_a_participant, ConversationStore};
use crate::error::Result;
use crate::message_store::MessageStore;
use crate::messaging_types::{
    Conversation, ConversationId, ConversationSummary, MessagingStats, UserId,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Clone)]
pub struct UnreadAccounting {
    conversations: ConversationStore,
    messages: MessageStore,
}

impl UnreadAccounting {
    pub fn new(conversations: ConversationStore, messages: MessageStore) -> Self {
        Self {
            conversations,
            messages,
        }
    }

    /// Messages after the user's watermark, sent by someone else, not deleted.
    /// Zero for non-participants.
    pub fn unread_count(&self, conversation_id: ConversationId, user_id: UserId) -> Result<u64> {
        match self.conversations.participant(conversation_id, user_id)? {
            Some(p) => self.count_after(conversation_id, user_id, p.last_read_sequence),
            None => Ok(0),
        }
    }

    fn count_after(&self, conversation_id: ConversationId, user_id: UserId, watermark: u64) -> Result<u64> {
        let mut count = 0;
        for m in self.messages.messages_after(conversation_id, watermark) {
            let m = m?;
            if m.sender_id != user_id && !m.is_deleted() {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn summarize(&self, conversation: Conversation, user_id: UserId) -> Result<ConversationSummary> {
        let me = self
            .conversations
            .participant(conversation.id, user_id)?
            .ok_or_else(|| not_a_participant(conversation.id, user_id))?;
        let unread_count = self.count_after(conversation.id, user_id, me.last_read_sequence)?;
        let last_message = self.messages.last_message(conversation.id)?.map(|m| m.preview());
        Ok(ConversationSummary {
            conversation,
            unread_count,
            last_message,
            my_role: me.role,
            my_last_read_sequence: me.last_read_sequence,
        })
    }

    pub fn unread_counts(&self, user_id: UserId) -> Result<BTreeMap<ConversationId, u64>> {
        let mut out = BTreeMap::new();
        for id in self.conversations.conversation_ids_for(user_id)? {
            out.insert(id, self.unread_count(id, user_id)?);
        }
        Ok(out)
    }

    /// Totals for the user's dashboard badge; "today" is the UTC day of `now`
    pub fn messaging_stats(&self, user_id: UserId, now: DateTime<Utc>) -> Result<MessagingStats> {
        let today = now.date_naive();
        let mut stats = MessagingStats {
            total_conversations: 0,
            unread_conversations: 0,
            messages_today: 0,
        };
        for id in self.conversations.conversation_ids_for(user_id)? {
            stats.total_conversations += 1;
            if self.unread_count(id, user_id)? > 0 {
                stats.unread_conversations += 1;
            }
            for m in self.messages.messages_after(id, 0) {
                let m = m?;
                if m.sender_id == user_id && m.created_at.date_naive() == today {
                    stats.messages_today += 1;
                }
            }
        }
        Ok(stats)
    }
}
