/// Huddle - staff messaging core
///
/// Conversations, an append-and-mutate message log with replies, edits,
/// tombstones and reactions, per-participant read state, and a stateless
/// cursor-based sync protocol for polling clients.

pub mod error;
pub mod config;
pub mod messaging_types;
pub mod storage;
pub mod conversation_store;
pub mod message_store;
pub mod unread;
pub mod sync_engine;
pub mod poller;
pub mod retry;
pub mod messaging_api;

pub use error::{ErrorClass, MessagingError, Result};
pub use config::Config;
pub use sync_engine::SyncEngine;
