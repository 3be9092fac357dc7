//! Storage collaborator seam for the real-time core.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use messenger_common::{ChatId, MessageId, SnowflakeGenerator, UserId};
use parking_lot::Mutex;

/// Whether a chat is a two-party conversation or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
}

impl ChatKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatKind::Private => "private",
            ChatKind::Group => "group",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "private" => Some(ChatKind::Private),
            "group" => Some(ChatKind::Group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    pub kind: ChatKind,
    pub name: Option<String>,
    pub last_activity_at: DateTime<Utc>,
}

/// Sender display fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub id: UserId,
    pub username: String,
    pub avatar: Option<String>,
}

/// A message about to be persisted. `content` is already encrypted.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub content: Vec<u8>,
    pub kind: String,
}

/// A persisted message. `content` is ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub content: Vec<u8>,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] diesel_async::pooled_connection::deadpool::PoolError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Everything the gateway needs from relational storage.
///
/// Backed by PostgreSQL in production and an in-memory map in tests.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>, StoreError>;
    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, StoreError>;
    async fn chat_by_id(&self, chat_id: ChatId) -> Result<Chat, StoreError>;
    async fn user_by_id(&self, user_id: UserId) -> Result<UserProfile, StoreError>;
    async fn persist_message(&self, message: NewChatMessage) -> Result<StoredMessage, StoreError>;
    async fn update_chat_activity(
        &self,
        chat_id: ChatId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn message_by_id(&self, message_id: MessageId) -> Result<StoredMessage, StoreError>;
    async fn mark_message_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation (single node / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryData {
    users: HashMap<UserId, UserProfile>,
    chats: HashMap<ChatId, Chat>,
    members: HashMap<ChatId, Vec<UserId>>,
    messages: HashMap<MessageId, StoredMessage>,
    reads: HashSet<(MessageId, UserId)>,
}

pub struct MemoryChatStore {
    data: Mutex<MemoryData>,
    snowflake: Arc<SnowflakeGenerator>,
}

impl MemoryChatStore {
    pub fn new(snowflake: Arc<SnowflakeGenerator>) -> Self {
        Self {
            data: Mutex::new(MemoryData::default()),
            snowflake,
        }
    }

    pub fn insert_user(&self, id: UserId, username: &str) {
        self.data.lock().users.insert(
            id,
            UserProfile {
                id,
                username: username.to_string(),
                avatar: None,
            },
        );
    }

    /// Create a chat with the given members. Member order is preserved.
    pub fn insert_chat(&self, id: ChatId, kind: ChatKind, members: &[UserId]) {
        let mut data = self.data.lock();
        data.chats.insert(
            id,
            Chat {
                id,
                kind,
                name: None,
                last_activity_at: Utc::now(),
            },
        );
        data.members.insert(id, members.to_vec());
    }

    /// Users who have marked `message_id` as read.
    pub fn readers_of(&self, message_id: MessageId) -> Vec<UserId> {
        let mut readers: Vec<_> = self
            .data
            .lock()
            .reads
            .iter()
            .filter(|(id, _)| *id == message_id)
            .map(|(_, user)| *user)
            .collect();
        readers.sort_unstable();
        readers
    }

    pub fn message_count(&self, chat_id: ChatId) -> usize {
        self.data
            .lock()
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .count()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .data
            .lock()
            .members
            .get(&chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self
            .data
            .lock()
            .members
            .get(&chat_id)
            .is_some_and(|members| members.contains(&user_id)))
    }

    async fn chat_by_id(&self, chat_id: ChatId) -> Result<Chat, StoreError> {
        self.data
            .lock()
            .chats
            .get(&chat_id)
            .cloned()
            .ok_or(StoreError::NotFound("chat"))
    }

    async fn user_by_id(&self, user_id: UserId) -> Result<UserProfile, StoreError> {
        self.data
            .lock()
            .users
            .get(&user_id)
            .cloned()
            .ok_or(StoreError::NotFound("user"))
    }

    async fn persist_message(&self, message: NewChatMessage) -> Result<StoredMessage, StoreError> {
        let stored = StoredMessage {
            id: self.snowflake.generate(),
            chat_id: message.chat_id,
            user_id: message.user_id,
            content: message.content,
            kind: message.kind,
            created_at: Utc::now(),
        };
        self.data.lock().messages.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_chat_activity(
        &self,
        chat_id: ChatId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        let chat = data
            .chats
            .get_mut(&chat_id)
            .ok_or(StoreError::NotFound("chat"))?;
        chat.last_activity_at = at;
        Ok(())
    }

    async fn message_by_id(&self, message_id: MessageId) -> Result<StoredMessage, StoreError> {
        self.data
            .lock()
            .messages
            .get(&message_id)
            .cloned()
            .ok_or(StoreError::NotFound("message"))
    }

    async fn mark_message_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        let mut data = self.data.lock();
        if !data.messages.contains_key(&message_id) {
            return Err(StoreError::NotFound("message"));
        }
        data.reads.insert((message_id, user_id));
        Ok(())
    }
}
