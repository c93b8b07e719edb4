/// Conversation Store: conversation records, membership, read watermarks
use crate::error::{MessagingError, Result};
use crate::messaging_types::{
    Caller, Conversation, ConversationFilter, ConversationId, ConversationKind,
    ConversationUpdate, NewConversation, Participant, ParticipantRole, UserId,
};
use crate::storage::{abort, decode, encode, key1, key2, read_u64, tx_result, Storage};
use chrono::Utc;
use sled::transaction::{ConflictableTransactionResult, TransactionalTree};
use sled::Transactional;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::{debug, info};

#[derive(Clone)]
pub struct ConversationStore {
    storage: Storage,
}

impl ConversationStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Create a conversation. The creator is always a participant and becomes
    /// its admin. A direct conversation between a pair that already has one
    /// returns the existing conversation instead.
    pub fn create_conversation(&self, creator: UserId, req: NewConversation) -> Result<Conversation> {
        let participant_ids = normalize_participants(creator, &req.participant_ids);
        validate_shape(&req, creator, &participant_ids)?;

        let direct_pair = match req.kind {
            ConversationKind::Direct => {
                let (a, b) = (participant_ids[0], participant_ids[1]);
                Some(key2(a.0.min(b.0), a.0.max(b.0)))
            }
            _ => None,
        };

        let id = ConversationId(self.storage.next_id()?);
        let now = Utc::now();
        let conversation = Conversation {
            id,
            kind: req.kind,
            title: non_blank(req.title),
            description: non_blank(req.description),
            guest_id: req.guest_id,
            participant_ids: participant_ids.clone(),
            created_by: creator,
            is_archived: false,
            is_pinned: false,
            is_locked: false,
            created_at: now,
            last_activity_at: now,
            updated_at: now,
            last_sequence: 0,
            revision: 0,
        };
        let conversation_bytes = encode(&conversation)?;

        let mut rows = Vec::with_capacity(participant_ids.len());
        for user_id in &participant_ids {
            let p = Participant {
                conversation_id: id,
                user_id: *user_id,
                role: if *user_id == creator {
                    ParticipantRole::Admin
                } else {
                    ParticipantRole::Member
                },
                last_read_sequence: 0,
                joined_at: now,
            };
            rows.push((key2(id.0, user_id.0), key2(user_id.0, id.0), encode(&p)?));
        }

        let s = &self.storage;
        let (conversation, created) = tx_result(
            (&s.conversations, &s.participants, &s.memberships, &s.direct_pairs).transaction(
                |(convs, parts, mems, pairs)| -> ConflictableTransactionResult<(Conversation, bool), MessagingError> {
                    if let Some(pair) = &direct_pair {
                        if let Some(existing) = pairs.get(pair.as_slice())? {
                            let existing_id = read_u64(&existing, 0).map_err(abort)?;
                            let found = load_in_tx(convs, ConversationId(existing_id))?;
                            return Ok((found, false));
                        }
                        pairs.insert(pair.as_slice(), key1(id.0))?;
                    }
                    convs.insert(key1(id.0).as_slice(), conversation_bytes.clone())?;
                    for (participant_key, membership_key, value) in &rows {
                        parts.insert(participant_key.as_slice(), value.clone())?;
                        mems.insert(membership_key.as_slice(), Vec::<u8>::new())?;
                    }
                    Ok((conversation.clone(), true))
                },
            ),
        )?;

        if created {
            info!(
                "Created {:?} conversation {} with {} participants",
                conversation.kind,
                conversation.id,
                conversation.participant_ids.len()
            );
        } else {
            debug!("Direct conversation {} already exists for pair", conversation.id);
        }
        Ok(conversation)
    }

    pub fn get(&self, id: ConversationId) -> Result<Conversation> {
        match self.storage.conversations.get(key1(id.0))? {
            Some(raw) => decode(&raw),
            None => Err(MessagingError::ConversationNotFound(id.0)),
        }
    }

    pub fn participant(&self, id: ConversationId, user_id: UserId) -> Result<Option<Participant>> {
        match self.storage.participants.get(key2(id.0, user_id.0))? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// The caller's membership, or `NotAuthorized` for outsiders
    pub fn require_participant(&self, id: ConversationId, user_id: UserId) -> Result<Participant> {
        self.get(id)?;
        self.participant(id, user_id)?
            .ok_or_else(|| not_a_participant(id, user_id))
    }

    pub fn participants(&self, id: ConversationId) -> Result<Vec<Participant>> {
        let mut out = Vec::new();
        for entry in self.storage.participants.scan_prefix(key1(id.0)) {
            let (_, value) = entry?;
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn conversation_ids_for(&self, user_id: UserId) -> Result<Vec<ConversationId>> {
        let mut out = Vec::new();
        for entry in self.storage.memberships.scan_prefix(key1(user_id.0)) {
            let (key, _) = entry?;
            out.push(ConversationId(read_u64(&key, 8)?));
        }
        Ok(out)
    }

    /// Conversations the user belongs to, pinned first, then most recent
    /// activity first. `filter.search` is not applied here: it needs the last
    /// message preview, which the summary layer resolves.
    pub fn list_conversations_for(
        &self,
        user_id: UserId,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>> {
        let mut out = Vec::new();
        for id in self.conversation_ids_for(user_id)? {
            let conv = match self.get(id) {
                Ok(c) => c,
                // membership row outlived a concurrent removal; skip
                Err(MessagingError::ConversationNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if conv.is_archived && !filter.include_archived {
                continue;
            }
            if filter.pinned_only && !conv.is_pinned {
                continue;
            }
            if filter.kind.is_some_and(|k| k != conv.kind) {
                continue;
            }
            out.push(conv);
        }
        out.sort_by(list_order);
        Ok(out)
    }

    pub fn add_participants(
        &self,
        id: ConversationId,
        user_ids: &[UserId],
        actor: &Caller,
    ) -> Result<Conversation> {
        if user_ids.is_empty() {
            return Err(MessagingError::InvalidConversationShape(
                "no participants given".to_string(),
            ));
        }
        let s = &self.storage;
        let conversation = tx_result((&s.conversations, &s.participants, &s.memberships).transaction(
            |(convs, parts, mems)| -> ConflictableTransactionResult<Conversation, MessagingError> {
                let mut conv = load_in_tx(convs, id)?;
                if !conv.has_participant(actor.user_id) {
                    return Err(abort(not_a_participant(id, actor.user_id)));
                }
                match conv.kind {
                    ConversationKind::Direct => {
                        return Err(abort(MessagingError::InvalidConversationShape(
                            "direct conversations have a fixed pair of participants".to_string(),
                        )))
                    }
                    ConversationKind::Broadcast if !actor.is_privileged() => {
                        return Err(abort(MessagingError::NotAuthorized(
                            "only managers may add participants to a broadcast".to_string(),
                        )))
                    }
                    _ => {}
                }

                let now = Utc::now();
                let mut added = 0;
                for user_id in user_ids {
                    if let Err(pos) = conv.participant_ids.binary_search(user_id) {
                        conv.participant_ids.insert(pos, *user_id);
                        let p = Participant {
                            conversation_id: id,
                            user_id: *user_id,
                            role: ParticipantRole::Member,
                            last_read_sequence: 0,
                            joined_at: now,
                        };
                        parts.insert(key2(id.0, user_id.0).as_slice(), encode(&p).map_err(abort)?)?;
                        mems.insert(key2(user_id.0, id.0).as_slice(), Vec::<u8>::new())?;
                        added += 1;
                    }
                }
                if added > 0 {
                    conv.updated_at = now;
                    convs.insert(key1(id.0).as_slice(), encode(&conv).map_err(abort)?)?;
                }
                Ok(conv)
            },
        ))?;

        info!("User {} added participants to conversation {}", actor.user_id, id);
        Ok(conversation)
    }

    /// Remove `user_id`. Participants may always leave; removing someone else
    /// takes a conversation admin or a manager.
    pub fn remove_participant(
        &self,
        id: ConversationId,
        user_id: UserId,
        actor: &Caller,
    ) -> Result<Conversation> {
        let s = &self.storage;
        let conversation = tx_result((&s.conversations, &s.participants, &s.memberships).transaction(
            |(convs, parts, mems)| -> ConflictableTransactionResult<Conversation, MessagingError> {
                let mut conv = load_in_tx(convs, id)?;
                if !conv.has_participant(actor.user_id) {
                    return Err(abort(not_a_participant(id, actor.user_id)));
                }
                if conv.kind == ConversationKind::Direct {
                    return Err(abort(MessagingError::InvalidConversationShape(
                        "direct conversations have a fixed pair of participants".to_string(),
                    )));
                }
                let pos = conv.participant_ids.binary_search(&user_id).map_err(|_| {
                    abort(MessagingError::InvalidConversationShape(format!(
                        "user {} is not a participant",
                        user_id
                    )))
                })?;
                if user_id != actor.user_id
                    && !actor.is_privileged()
                    && !is_admin_in_tx(parts, id, actor.user_id)?
                {
                    return Err(abort(MessagingError::NotAuthorized(
                        "only admins may remove other participants".to_string(),
                    )));
                }
                if conv.participant_ids.len() == 1 {
                    return Err(abort(MessagingError::InvalidConversationShape(
                        "cannot remove the last participant".to_string(),
                    )));
                }

                conv.participant_ids.remove(pos);
                conv.updated_at = Utc::now();
                parts.remove(key2(id.0, user_id.0).as_slice())?;
                mems.remove(key2(user_id.0, id.0).as_slice())?;
                convs.insert(key1(id.0).as_slice(), encode(&conv).map_err(abort)?)?;
                Ok(conv)
            },
        ))?;

        info!("User {} removed {} from conversation {}", actor.user_id, user_id, id);
        Ok(conversation)
    }

    /// Advance the participant's watermark to `max(current, up_to_sequence)`.
    /// Never regresses, so out-of-order and repeated calls are harmless.
    pub fn mark_read(
        &self,
        id: ConversationId,
        user_id: UserId,
        up_to_sequence: u64,
    ) -> Result<Participant> {
        let conv = self.get(id)?;
        // a watermark past the end would hide messages not yet written
        let target = up_to_sequence.min(conv.last_sequence);
        let key = key2(id.0, user_id.0);

        loop {
            let current = self
                .storage
                .participants
                .get(&key)?
                .ok_or_else(|| not_a_participant(id, user_id))?;
            let mut p: Participant = decode(&current)?;
            if target <= p.last_read_sequence {
                return Ok(p);
            }
            p.last_read_sequence = target;
            let swapped = self
                .storage
                .participants
                .compare_and_swap(&key, Some(&current), Some(encode(&p)?))?;
            if swapped.is_ok() {
                debug!("User {} read conversation {} up to {}", user_id, id, target);
                return Ok(p);
            }
        }
    }

    pub fn update_conversation(
        &self,
        id: ConversationId,
        actor: &Caller,
        update: ConversationUpdate,
    ) -> Result<Conversation> {
        let s = &self.storage;
        let conversation = tx_result((&s.conversations, &s.participants).transaction(
            |(convs, parts)| -> ConflictableTransactionResult<Conversation, MessagingError> {
                let mut conv = load_in_tx(convs, id)?;
                if !conv.has_participant(actor.user_id) {
                    return Err(abort(not_a_participant(id, actor.user_id)));
                }
                if let Some(title) = &update.title {
                    if conv.kind == ConversationKind::Direct {
                        return Err(abort(MessagingError::InvalidConversationShape(
                            "direct conversations cannot have a title".to_string(),
                        )));
                    }
                    if title.trim().is_empty() {
                        return Err(abort(MessagingError::InvalidConversationShape(
                            "title cannot be blank".to_string(),
                        )));
                    }
                    conv.title = Some(title.trim().to_string());
                }
                if let Some(description) = &update.description {
                    conv.description = non_blank(Some(description.clone()));
                }
                if let Some(locked) = update.is_locked {
                    if locked != conv.is_locked
                        && !actor.is_privileged()
                        && !is_admin_in_tx(parts, id, actor.user_id)?
                    {
                        return Err(abort(MessagingError::NotAuthorized(
                            "only admins may lock or unlock a conversation".to_string(),
                        )));
                    }
                    conv.is_locked = locked;
                }
                if let Some(archived) = update.is_archived {
                    conv.is_archived = archived;
                }
                if let Some(pinned) = update.is_pinned {
                    conv.is_pinned = pinned;
                }
                conv.updated_at = Utc::now();
                convs.insert(key1(id.0).as_slice(), encode(&conv).map_err(abort)?)?;
                Ok(conv)
            },
        ))?;

        info!("User {} updated conversation {}", actor.user_id, id);
        Ok(conversation)
    }
}

/// Pinned first, then most recent activity, then highest id
pub fn list_order(a: &Conversation, b: &Conversation) -> Ordering {
    b.is_pinned
        .cmp(&a.is_pinned)
        .then(b.last_activity_at.cmp(&a.last_activity_at))
        .then(b.id.cmp(&a.id))
}

/// Read a conversation inside a transaction; conflicts propagate so sled retries
pub(crate) fn load_in_tx(
    convs: &TransactionalTree,
    id: ConversationId,
) -> ConflictableTransactionResult<Conversation, MessagingError> {
    let raw = convs
        .get(key1(id.0))?
        .ok_or_else(|| abort(MessagingError::ConversationNotFound(id.0)))?;
    decode(&raw).map_err(abort)
}

pub(crate) fn is_admin_in_tx(
    parts: &TransactionalTree,
    id: ConversationId,
    user_id: UserId,
) -> ConflictableTransactionResult<bool, MessagingError> {
    match parts.get(key2(id.0, user_id.0))? {
        Some(raw) => Ok(decode::<Participant>(&raw).map_err(abort)?.role == ParticipantRole::Admin),
        None => Ok(false),
    }
}

pub(crate) fn not_a_participant(id: ConversationId, user_id: UserId) -> MessagingError {
    MessagingError::NotAuthorized(format!(
        "user {} is not a participant of conversation {}",
        user_id, id
    ))
}

fn normalize_participants(creator: UserId, requested: &[UserId]) -> Vec<UserId> {
    let mut set: BTreeSet<UserId> = requested.iter().copied().collect();
    set.insert(creator);
    set.into_iter().collect()
}

fn validate_shape(req: &NewConversation, creator: UserId, participants: &[UserId]) -> Result<()> {
    let shape = |msg: &str| Err(MessagingError::InvalidConversationShape(msg.to_string()));

    if req.participant_ids.iter().all(|u| *u == creator) {
        return shape("at least one other participant is required");
    }
    match req.kind {
        ConversationKind::Direct => {
            if participants.len() != 2 {
                return shape("direct conversations need exactly one other participant");
            }
            if non_blank(req.title.clone()).is_some() {
                return shape("direct conversations cannot have a title");
            }
        }
        kind => {
            if non_blank(req.title.clone()).is_none() {
                return Err(MessagingError::InvalidConversationShape(format!(
                    "{:?} conversations require a title",
                    kind
                )));
            }
            if kind == ConversationKind::GuestRelated && req.guest_id.is_none() {
                return shape("guest-related conversations require a guest reference");
            }
        }
    }
    Ok(())
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}
