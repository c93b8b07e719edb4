/// Persistence: one sled database, one tree per relation
/// Keys are big-endian u64 composites so range scans come back in order;
/// values are JSON.
use crate::error::{MessagingError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::path::Path;
use tracing::{debug, info};

/// conversation id → Conversation
const CONVERSATIONS: &str = "conversations";
/// (conversation id, user id) → Participant
const PARTICIPANTS: &str = "participants";
/// (user id, conversation id) → ()
const MEMBERSHIPS: &str = "memberships";
/// (min user id, max user id) → conversation id
const DIRECT_PAIRS: &str = "direct_pairs";
/// (conversation id, sequence) → Message
const MESSAGES: &str = "messages";
/// message id → (conversation id, sequence)
const MESSAGE_INDEX: &str = "message_index";
/// reply target message id → sequences of the replies to it
const REPLY_INDEX: &str = "reply_index";
/// (conversation id, revision) → sequence
const CHANGES: &str = "changes";
/// (message id, reaction type) → ReactionAggregate
const REACTIONS: &str = "reactions";
/// (conversation id, sender id, client uuid) → message id
const CLIENT_IDS: &str = "client_ids";

#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
    pub conversations: sled::Tree,
    pub participants: sled::Tree,
    pub memberships: sled::Tree,
    pub direct_pairs: sled::Tree,
    pub messages: sled::Tree,
    pub message_index: sled::Tree,
    pub reply_index: sled::Tree,
    pub changes: sled::Tree,
    pub reactions: sled::Tree,
    pub client_ids: sled::Tree,
}

impl Storage {
    /// Open (or create) the messaging database under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join("messaging.db");
        debug!("Opening messaging store at {:?}", db_path);

        let db = sled::open(&db_path)
            .map_err(|e| MessagingError::Storage(format!("Failed to open messaging DB: {}", e)))?;
        let storage = Self::from_db(db)?;

        info!(
            "Messaging store initialized at {:?} ({} conversations)",
            db_path,
            storage.conversations.len()
        );
        Ok(storage)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            conversations: db.open_tree(CONVERSATIONS)?,
            participants: db.open_tree(PARTICIPANTS)?,
            memberships: db.open_tree(MEMBERSHIPS)?,
            direct_pairs: db.open_tree(DIRECT_PAIRS)?,
            messages: db.open_tree(MESSAGES)?,
            message_index: db.open_tree(MESSAGE_INDEX)?,
            reply_index: db.open_tree(REPLY_INDEX)?,
            changes: db.open_tree(CHANGES)?,
            reactions: db.open_tree(REACTIONS)?,
            client_ids: db.open_tree(CLIENT_IDS)?,
            db,
        })
    }

    /// Allocate a fresh entity id; never 0
    pub fn next_id(&self) -> Result<u64> {
        Ok(self.db.generate_id()? + 1)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

pub fn key1(a: u64) -> Vec<u8> {
    a.to_be_bytes().to_vec()
}

pub fn key2(a: u64, b: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(16);
    k.extend_from_slice(&a.to_be_bytes());
    k.extend_from_slice(&b.to_be_bytes());
    k
}

/// `key1(a)` followed by arbitrary bytes
pub fn key_with_suffix(a: u64, suffix: &[u8]) -> Vec<u8> {
    let mut k = key1(a);
    k.extend_from_slice(suffix);
    k
}

/// Read the u64 at `offset` of a composite key
pub fn read_u64(key: &[u8], offset: usize) -> Result<u64> {
    key.get(offset..offset + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| MessagingError::Storage(format!("corrupt key of {} bytes", key.len())))
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Lift a domain error into a transaction abort
pub fn abort(e: MessagingError) -> ConflictableTransactionError<MessagingError> {
    ConflictableTransactionError::Abort(e)
}

/// Map a finished transaction outside the retryable critical sections
pub fn tx_result<T>(r: std::result::Result<T, TransactionError<MessagingError>>) -> Result<T> {
    r.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => MessagingError::Storage(e.to_string()),
    })
}

/// Map a finished transaction inside sequence assignment or reaction toggling;
/// store-level failures there are reported as retryable contention
pub fn contended<T>(r: std::result::Result<T, TransactionError<MessagingError>>) -> Result<T> {
    r.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => MessagingError::Contention(e.to_string()),
    })
}
