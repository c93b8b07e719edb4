/// Error types for the messaging core
use thiserror::Error;

/// Whether a caller may transparently retry a failed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself is wrong or no longer applicable; retrying cannot help
    Permanent,
    /// Transient store contention; safe to retry with backoff
    Retryable,
}

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Invalid conversation shape: {0}")]
    InvalidConversationShape(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Conversation {0} not found")]
    ConversationNotFound(u64),

    #[error("Message {0} not found")]
    MessageNotFound(u64),

    #[error("Reply target {0} not found in this conversation")]
    ReplyTargetNotFound(u64),

    #[error("Message {0} has been deleted")]
    MessageDeleted(u64),

    #[error("Conversation {0} is locked")]
    ConversationLocked(u64),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Store contention: {0}")]
    Contention(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MessagingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MessagingError::Contention(_) => ErrorClass::Retryable,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Stable snake_case name used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            MessagingError::InvalidConversationShape(_) => "invalid_conversation_shape",
            MessagingError::NotAuthorized(_) => "not_authorized",
            MessagingError::ConversationNotFound(_) => "conversation_not_found",
            MessagingError::MessageNotFound(_) => "message_not_found",
            MessagingError::ReplyTargetNotFound(_) => "reply_target_not_found",
            MessagingError::MessageDeleted(_) => "message_deleted",
            MessagingError::ConversationLocked(_) => "conversation_locked",
            MessagingError::InvalidMessage(_) => "invalid_message",
            MessagingError::InvalidCursor(_) => "invalid_cursor",
            MessagingError::Contention(_) => "contention",
            MessagingError::Storage(_) => "storage",
            MessagingError::Serialization(_) => "serialization",
            MessagingError::Io(_) => "io",
            MessagingError::Config(_) => "config",
        }
    }
}

impl From<sled::Error> for MessagingError {
    fn from(e: sled::Error) -> Self {
        MessagingError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
