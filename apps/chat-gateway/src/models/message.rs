use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::{message_reads, messages};
use crate::db::store::StoredMessage;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = messages)]
pub struct Message {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub content: Vec<u8>,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage<'a> {
    pub id: i64,
    pub chat_id: i64,
    pub user_id: i64,
    pub content: &'a [u8],
    pub kind: &'a str,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = message_reads)]
pub struct NewMessageRead {
    pub message_id: i64,
    pub user_id: i64,
    pub read_at: DateTime<Utc>,
}

impl From<Message> for StoredMessage {
    fn from(row: Message) -> Self {
        Self {
            id: row.id,
            chat_id: row.chat_id,
            user_id: row.user_id,
            content: row.content,
            kind: row.kind,
            created_at: row.created_at,
        }
    }
}
