use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::db::schema::{chat_members, chats};
use crate::db::store::{self, ChatKind, StoreError};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = chats)]
pub struct Chat {
    pub id: i64,
    pub kind: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl TryFrom<Chat> for store::Chat {
    type Error = StoreError;

    fn try_from(row: Chat) -> Result<Self, Self::Error> {
        let kind = ChatKind::parse(&row.kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown chat kind {:?}", row.kind)))?;
        Ok(Self {
            id: row.id,
            kind,
            name: row.name,
            last_activity_at: row.last_activity_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = chat_members)]
pub struct ChatMember {
    pub chat_id: i64,
    pub user_id: i64,
    pub joined_at: DateTime<Utc>,
}
