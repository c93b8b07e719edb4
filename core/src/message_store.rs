/// Message Store: per-conversation message log, tombstones and reactions
///
/// Every mutation runs in one sled transaction that also rewrites the owning
/// conversation record. That record carries the sequence and revision
/// counters, so writers to the same conversation serialize on it while
/// different conversations proceed in parallel.
use crate::conversation_store::{is_admin_in_tx, load_in_tx, not_a_participant};
use crate::error::{MessagingError, Result};
use crate::messaging_types::{
    Caller, Conversation, ConversationId, Message, MessageId, MessageType, MessageView, NewMessage,
    ReactionAggregate, ReplyPreview, UserId,
};
use crate::storage::{
    abort, contended, decode, encode, key1, key2, key_with_suffix, read_u64, tx_result, Storage,
};
use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use sled::Transactional;
use tracing::{debug, info, warn};

pub const MAX_CONTENT_LEN: usize = 10_000;
const MAX_REACTION_LEN: usize = 32;

#[derive(Clone)]
pub struct MessageStore {
    storage: Storage,
}

impl MessageStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Append a message, assigning the next sequence of its conversation.
    /// Retrying with the same `client_message_id` returns the original message.
    pub fn append_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        msg: NewMessage,
    ) -> Result<Message> {
        let content = validate_new_message(&msg)?;
        let id = MessageId(self.storage.next_id()?);
        let cid = conversation_id.0;
        let client_key = msg.client_message_id.map(|uuid| {
            let mut k = key2(cid, sender_id.0);
            k.extend_from_slice(uuid.as_bytes());
            k
        });

        let s = &self.storage;
        let message = contended(
            (
                &s.conversations,
                &s.participants,
                &s.messages,
                &s.message_index,
                &s.reply_index,
                &s.changes,
                &s.client_ids,
            )
                .transaction(
                    |(convs, parts, msgs, index, replies, changes, client_ids)| -> ConflictableTransactionResult<Message, MessagingError> {
                        let mut conv = load_in_tx(convs, conversation_id)?;
                        if parts.get(key2(cid, sender_id.0))?.is_none() {
                            return Err(abort(not_a_participant(conversation_id, sender_id)));
                        }
                        if let Some(k) = &client_key {
                            if let Some(existing) = client_ids.get(k.as_slice())? {
                                let existing_id = read_u64(&existing, 0).map_err(abort)?;
                                return load_message_in_tx(index, msgs, MessageId(existing_id));
                            }
                        }
                        if conv.is_locked {
                            return Err(abort(MessagingError::ConversationLocked(cid)));
                        }
                        if let Some(target) = msg.reply_to_message_id {
                            // the target already exists, so it precedes this message: no cycles
                            let location = index
                                .get(key1(target.0))?
                                .ok_or_else(|| abort(MessagingError::ReplyTargetNotFound(target.0)))?;
                            if read_u64(&location, 0).map_err(abort)? != cid {
                                return Err(abort(MessagingError::ReplyTargetNotFound(target.0)));
                            }
                        }

                        let now = Utc::now();
                        let sequence = conv.last_sequence + 1;
                        let revision = conv.revision + 1;
                        let message = Message {
                            id,
                            conversation_id,
                            sequence,
                            revision,
                            sender_id,
                            content: content.clone(),
                            message_type: msg.message_type,
                            attachment: msg.attachment.clone(),
                            is_priority: msg.is_priority,
                            reply_to_message_id: msg.reply_to_message_id,
                            client_message_id: msg.client_message_id,
                            created_at: now,
                            edited_at: None,
                            deleted_at: None,
                        };

                        msgs.insert(key2(cid, sequence).as_slice(), encode(&message).map_err(abort)?)?;
                        index.insert(key1(id.0).as_slice(), key2(cid, sequence))?;
                        changes.insert(key2(cid, revision).as_slice(), key1(sequence))?;
                        if let Some(k) = &client_key {
                            client_ids.insert(k.as_slice(), key1(id.0))?;
                        }
                        if let Some(target) = msg.reply_to_message_id {
                            let mut sequences = replies_in_tx(replies, target)?;
                            sequences.push(sequence);
                            replies.insert(key1(target.0).as_slice(), encode(&sequences).map_err(abort)?)?;
                        }

                        conv.last_sequence = sequence;
                        conv.revision = revision;
                        conv.last_activity_at = now;
                        conv.updated_at = now;
                        convs.insert(key1(cid).as_slice(), encode(&conv).map_err(abort)?)?;
                        Ok(message)
                    },
                ),
        )?;

        debug!(
            "Message {} appended to conversation {} at sequence {}",
            message.id, conversation_id, message.sequence
        );
        Ok(message)
    }

    /// Replace the content of a message. Only its sender may edit, and not
    /// after deletion. No edit history is kept.
    pub fn edit_message(&self, message_id: MessageId, actor: UserId, new_content: &str) -> Result<Message> {
        let content = new_content.trim().to_string();
        validate_content_len(&content)?;
        if content.is_empty() {
            return Err(MessagingError::InvalidMessage("message content is required".to_string()));
        }

        let s = &self.storage;
        let message = tx_result(
            (
                &s.conversations,
                &s.participants,
                &s.message_index,
                &s.messages,
                &s.reply_index,
                &s.changes,
            )
                .transaction(
                    |(convs, parts, index, msgs, replies, changes)| -> ConflictableTransactionResult<Message, MessagingError> {
                        let mut m = load_message_in_tx(index, msgs, message_id)?;
                        if m.sender_id != actor {
                            return Err(abort(MessagingError::NotAuthorized(
                                "only the sender may edit a message".to_string(),
                            )));
                        }
                        if parts.get(key2(m.conversation_id.0, actor.0))?.is_none() {
                            return Err(abort(not_a_participant(m.conversation_id, actor)));
                        }
                        if m.is_deleted() {
                            return Err(abort(MessagingError::MessageDeleted(message_id.0)));
                        }
                        let now = Utc::now();
                        m.content = content.clone();
                        m.edited_at = Some(now);
                        touch_message(convs, msgs, changes, &mut m, now)?;
                        touch_replies(convs, msgs, replies, changes, &m, now)?;
                        Ok(m)
                    },
                ),
        )?;

        info!("Message {} edited by {}", message_id, actor);
        Ok(message)
    }

    /// Tombstone a message: content is cleared, the row, sequence and reply
    /// linkage stay. Deleting twice returns the existing tombstone.
    pub fn delete_message(&self, message_id: MessageId, actor: &Caller) -> Result<Message> {
        let s = &self.storage;
        let message = tx_result(
            (
                &s.conversations,
                &s.participants,
                &s.message_index,
                &s.messages,
                &s.reply_index,
                &s.changes,
            )
                .transaction(
                |(convs, parts, index, msgs, replies, changes)| -> ConflictableTransactionResult<Message, MessagingError> {
                    let mut m = load_message_in_tx(index, msgs, message_id)?;
                    // a sender who has left keeps no rights over their old messages
                    let is_sender = m.sender_id == actor.user_id
                        && parts.get(key2(m.conversation_id.0, actor.user_id.0))?.is_some();
                    let allowed = is_sender
                        || actor.is_privileged()
                        || is_admin_in_tx(parts, m.conversation_id, actor.user_id)?;
                    if !allowed {
                        return Err(abort(MessagingError::NotAuthorized(
                            "only the sender, a conversation admin or a manager may delete".to_string(),
                        )));
                    }
                    if m.is_deleted() {
                        return Ok(m);
                    }
                    let now = Utc::now();
                    m.deleted_at = Some(now);
                    m.content.clear();
                    m.attachment = None;
                    touch_message(convs, msgs, changes, &mut m, now)?;
                    touch_replies(convs, msgs, replies, changes, &m, now)?;
                    Ok(m)
                },
            ),
        )?;

        info!("Message {} deleted by {}", message_id, actor.user_id);
        Ok(message)
    }

    /// Toggle `user_id`'s reaction of `reaction_type`; returns the aggregate
    /// for that type after the toggle (count 0 once the last user withdraws).
    pub fn react(&self, message_id: MessageId, user_id: UserId, reaction_type: &str) -> Result<ReactionAggregate> {
        let reaction_type = validate_reaction_type(reaction_type)?;
        let reaction_key = key_with_suffix(message_id.0, reaction_type.as_bytes());

        let s = &self.storage;
        let aggregate = contended(
            (
                &s.conversations,
                &s.participants,
                &s.message_index,
                &s.messages,
                &s.changes,
                &s.reactions,
            )
                .transaction(
                    |(convs, parts, index, msgs, changes, reactions)| -> ConflictableTransactionResult<ReactionAggregate, MessagingError> {
                        let mut m = load_message_in_tx(index, msgs, message_id)?;
                        if parts.get(key2(m.conversation_id.0, user_id.0))?.is_none() {
                            return Err(abort(not_a_participant(m.conversation_id, user_id)));
                        }
                        if m.is_deleted() {
                            return Err(abort(MessagingError::MessageDeleted(message_id.0)));
                        }

                        let mut aggregate = match reactions.get(reaction_key.as_slice())? {
                            Some(raw) => decode::<ReactionAggregate>(&raw).map_err(abort)?,
                            None => ReactionAggregate::empty(&reaction_type),
                        };
                        aggregate.toggle(user_id);
                        if aggregate.count == 0 {
                            reactions.remove(reaction_key.as_slice())?;
                        } else {
                            reactions.insert(reaction_key.as_slice(), encode(&aggregate).map_err(abort)?)?;
                        }
                        touch_message(convs, msgs, changes, &mut m, Utc::now())?;
                        Ok(aggregate)
                    },
                ),
        )?;

        debug!(
            "User {} toggled '{}' on message {} (count {})",
            user_id, aggregate.reaction_type, message_id, aggregate.count
        );
        Ok(aggregate)
    }

    pub fn get_message(&self, message_id: MessageId) -> Result<Message> {
        let location = self
            .storage
            .message_index
            .get(key1(message_id.0))?
            .ok_or(MessagingError::MessageNotFound(message_id.0))?;
        let raw = self
            .storage
            .messages
            .get(location)?
            .ok_or(MessagingError::MessageNotFound(message_id.0))?;
        decode(&raw)
    }

    pub fn reactions_for(&self, message_id: MessageId) -> Result<Vec<ReactionAggregate>> {
        let mut out = Vec::new();
        for entry in self.storage.reactions.scan_prefix(key1(message_id.0)) {
            let (_, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    /// Attach the resolved reply preview and reaction aggregates
    pub fn view(&self, message: Message) -> Result<MessageView> {
        let reply_to = match message.reply_to_message_id {
            Some(target) => match self.get_message(target) {
                Ok(t) => Some(ReplyPreview::of(&t)),
                Err(MessagingError::MessageNotFound(_)) => Some(ReplyPreview::purged(target)),
                Err(e) => return Err(e),
            },
            None => None,
        };
        let reactions = self.reactions_for(message.id)?;
        Ok(MessageView {
            message,
            reply_to,
            reactions,
        })
    }

    /// Messages with sequence greater than `since_sequence` in forward order,
    /// or the most recent `limit` when `since_sequence` is absent. Rows are
    /// read and resolved lazily as the iterator advances.
    pub fn list_messages(
        &self,
        conversation_id: ConversationId,
        since_sequence: Option<u64>,
        limit: usize,
    ) -> Result<MessageIter<'_>> {
        let cid = conversation_id.0;
        let start = match since_sequence {
            Some(since) => key2(cid, since.saturating_add(1)),
            None => match self
                .storage
                .messages
                .scan_prefix(key1(cid))
                .rev()
                .take(limit)
                .last()
            {
                Some(entry) => entry?.0.to_vec(),
                None => key2(cid, 0),
            },
        };
        Ok(MessageIter {
            store: self,
            inner: self.storage.messages.range(start..=key2(cid, u64::MAX)),
            remaining: limit,
        })
    }

    /// Raw messages after `after_sequence`, forward, without view resolution
    pub fn messages_after(
        &self,
        conversation_id: ConversationId,
        after_sequence: u64,
    ) -> impl Iterator<Item = Result<Message>> + '_ {
        let cid = conversation_id.0;
        self.storage
            .messages
            .range(key2(cid, after_sequence.saturating_add(1))..=key2(cid, u64::MAX))
            .map(|entry| -> Result<Message> {
                let (_, value) = entry?;
                decode(&value)
            })
    }

    pub fn last_message(&self, conversation_id: ConversationId) -> Result<Option<Message>> {
        match self.storage.messages.scan_prefix(key1(conversation_id.0)).next_back() {
            Some(entry) => Ok(Some(decode(&entry?.1)?)),
            None => Ok(None),
        }
    }

    /// Messages touched after `since_revision`, ordered by sequence, plus the
    /// revision to resume from and whether more changes are pending.
    pub fn changed_since(
        &self,
        conversation_id: ConversationId,
        since_revision: u64,
        limit: usize,
    ) -> Result<ChangeSet> {
        let cid = conversation_id.0;
        let mut views = Vec::new();
        let mut revision = since_revision;
        let mut has_more = false;

        for entry in self
            .storage
            .changes
            .range(key2(cid, since_revision.saturating_add(1))..=key2(cid, u64::MAX))
        {
            if views.len() >= limit {
                has_more = true;
                break;
            }
            let (key, value) = entry?;
            let change_revision = read_u64(&key, 8)?;
            let sequence = read_u64(&value, 0)?;
            let message: Message = match self.storage.messages.get(key2(cid, sequence))? {
                Some(raw) => decode(&raw)?,
                None => {
                    // purged between the two reads
                    revision = change_revision;
                    continue;
                }
            };
            if message.revision < change_revision {
                // the row has not caught up with its change entry yet; resume here next poll
                has_more = true;
                break;
            }
            revision = change_revision;
            if message.revision == change_revision {
                views.push(self.view(message)?);
            }
        }

        views.sort_by_key(|v| v.message.sequence);
        Ok(ChangeSet {
            messages: views,
            revision,
            has_more,
        })
    }

    /// Physically remove tombstones deleted before `cutoff`, together with
    /// their reactions and index entries. Replies to them keep rendering the
    /// deleted placeholder.
    pub fn purge_expired_tombstones(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut expired = Vec::new();
        for entry in self.storage.messages.iter() {
            let (_, value) = entry?;
            let m: Message = decode(&value)?;
            if m.deleted_at.is_some_and(|at| at < cutoff) {
                expired.push(m);
            }
        }

        let s = &self.storage;
        let mut purged = 0;
        for m in expired {
            let mut reaction_keys = Vec::new();
            for entry in s.reactions.scan_prefix(key1(m.id.0)) {
                reaction_keys.push(entry?.0.to_vec());
            }
            let cid = m.conversation_id.0;
            let client_key = m.client_message_id.map(|uuid| {
                let mut k = key2(cid, m.sender_id.0);
                k.extend_from_slice(uuid.as_bytes());
                k
            });

            let removed = tx_result(
                (&s.messages, &s.message_index, &s.reply_index, &s.changes, &s.reactions, &s.client_ids).transaction(
                    |(msgs, index, replies, changes, reactions, client_ids)| -> ConflictableTransactionResult<bool, MessagingError> {
                        let current = match msgs.get(key2(cid, m.sequence))? {
                            Some(raw) => decode::<Message>(&raw).map_err(abort)?,
                            None => return Ok(false),
                        };
                        msgs.remove(key2(cid, m.sequence).as_slice())?;
                        index.remove(key1(m.id.0).as_slice())?;
                        replies.remove(key1(m.id.0).as_slice())?;
                        changes.remove(key2(cid, current.revision).as_slice())?;
                        for k in &reaction_keys {
                            reactions.remove(k.as_slice())?;
                        }
                        if let Some(k) = &client_key {
                            client_ids.remove(k.as_slice())?;
                        }
                        Ok(true)
                    },
                ),
            );
            match removed {
                Ok(true) => purged += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to purge message {}: {}", m.id, e),
            }
        }

        if purged > 0 {
            info!("Purged {} expired tombstones", purged);
        }
        Ok(purged)
    }
}

/// Result of a change-feed read
#[derive(Debug)]
pub struct ChangeSet {
    pub messages: Vec<MessageView>,
    pub revision: u64,
    pub has_more: bool,
}

/// Lazy, finite, forward-ordered read over one conversation's log
pub struct MessageIter<'a> {
    store: &'a MessageStore,
    inner: sled::Iter,
    remaining: usize,
}

impl Iterator for MessageIter<'_> {
    type Item = Result<MessageView>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let entry = self.inner.next()?;
        self.remaining -= 1;
        Some(
            entry
                .map_err(MessagingError::from)
                .and_then(|(_, value)| decode::<Message>(&value))
                .and_then(|m| self.store.view(m)),
        )
    }
}

fn load_message_in_tx(
    index: &TransactionalTree,
    msgs: &TransactionalTree,
    message_id: MessageId,
) -> ConflictableTransactionResult<Message, MessagingError> {
    let location = index
        .get(key1(message_id.0))?
        .ok_or_else(|| abort(MessagingError::MessageNotFound(message_id.0)))?;
    let raw = msgs
        .get(location)?
        .ok_or_else(|| abort(MessagingError::MessageNotFound(message_id.0)))?;
    decode(&raw).map_err(abort)
}

/// Give `m` the conversation's next revision and persist both records
fn touch_message(
    convs: &TransactionalTree,
    msgs: &TransactionalTree,
    changes: &TransactionalTree,
    m: &mut Message,
    now: DateTime<Utc>,
) -> ConflictableTransactionResult<(), MessagingError> {
    let cid = m.conversation_id.0;
    let mut conv: Conversation = load_in_tx(convs, m.conversation_id)?;
    let revision = conv.revision + 1;

    changes.remove(key2(cid, m.revision).as_slice())?;
    changes.insert(key2(cid, revision).as_slice(), key1(m.sequence))?;
    m.revision = revision;
    msgs.insert(key2(cid, m.sequence).as_slice(), encode(&*m).map_err(abort)?)?;

    conv.revision = revision;
    conv.updated_at = now;
    convs.insert(key1(cid).as_slice(), encode(&conv).map_err(abort)?)?;
    Ok(())
}

/// Sequences of the messages replying to `target`
fn replies_in_tx(
    replies: &TransactionalTree,
    target: MessageId,
) -> ConflictableTransactionResult<Vec<u64>, MessagingError> {
    match replies.get(key1(target.0))? {
        Some(raw) => decode(&raw).map_err(abort),
        None => Ok(Vec::new()),
    }
}

/// Re-stamp every surviving reply to `target` so its preview is re-sent
fn touch_replies(
    convs: &TransactionalTree,
    msgs: &TransactionalTree,
    replies: &TransactionalTree,
    changes: &TransactionalTree,
    target: &Message,
    now: DateTime<Utc>,
) -> ConflictableTransactionResult<(), MessagingError> {
    let cid = target.conversation_id.0;
    for sequence in replies_in_tx(replies, target.id)? {
        // purged replies leave a stale sequence behind
        let mut reply: Message = match msgs.get(key2(cid, sequence))? {
            Some(raw) => decode(&raw).map_err(abort)?,
            None => continue,
        };
        touch_message(convs, msgs, changes, &mut reply, now)?;
    }
    Ok(())
}

fn validate_content_len(content: &str) -> Result<()> {
    if content.chars().count() > MAX_CONTENT_LEN {
        return Err(MessagingError::InvalidMessage(format!(
            "content exceeds {} characters",
            MAX_CONTENT_LEN
        )));
    }
    Ok(())
}

/// Returns the trimmed content to store
fn validate_new_message(msg: &NewMessage) -> Result<String> {
    let content = msg.content.trim().to_string();
    validate_content_len(&content)?;
    match msg.message_type {
        MessageType::Text | MessageType::System => {
            if content.is_empty() {
                return Err(MessagingError::InvalidMessage(
                    "message content is required".to_string(),
                ));
            }
        }
        MessageType::File => {
            let attachment = msg.attachment.as_ref().ok_or_else(|| {
                MessagingError::InvalidMessage("file messages require an attachment".to_string())
            })?;
            if attachment.url.trim().is_empty() || attachment.name.trim().is_empty() {
                return Err(MessagingError::InvalidMessage(
                    "attachment needs a url and a name".to_string(),
                ));
            }
        }
    }
    Ok(content)
}

fn validate_reaction_type(raw: &str) -> Result<String> {
    let t = raw.trim().to_ascii_lowercase();
    let valid = !t.is_empty()
        && t.len() <= MAX_REACTION_LEN
        && t.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if !valid {
        return Err(MessagingError::InvalidMessage(format!(
            "invalid reaction type '{}'",
            raw
        )));
    }
    Ok(t)
}
