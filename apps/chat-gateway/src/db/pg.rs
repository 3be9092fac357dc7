//! PostgreSQL-backed [`ChatStore`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use messenger_common::{ChatId, MessageId, SnowflakeGenerator, UserId};

use crate::models::chat::{Chat as ChatRow, ChatMember};
use crate::models::message::{Message, NewMessage, NewMessageRead};
use crate::models::user::User;

use super::pool::DbPool;
use super::schema::{chat_members, chats, message_reads, messages, users};
use super::store::{Chat, ChatStore, NewChatMessage, StoreError, StoredMessage, UserProfile};

pub struct PgChatStore {
    db: DbPool,
    snowflake: Arc<SnowflakeGenerator>,
}

impl PgChatStore {
    pub fn new(db: DbPool, snowflake: Arc<SnowflakeGenerator>) -> Self {
        Self { db, snowflake }
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    async fn chat_members(&self, chat_id: ChatId) -> Result<Vec<UserId>, StoreError> {
        let mut conn = self.db.get().await?;

        let members: Vec<ChatMember> = diesel_async::RunQueryDsl::load(
            chat_members::table
                .filter(chat_members::chat_id.eq(chat_id))
                .order(chat_members::joined_at.asc())
                .select(ChatMember::as_select()),
            &mut conn,
        )
        .await?;

        Ok(members.into_iter().map(|m| m.user_id).collect())
    }

    async fn is_member(&self, chat_id: ChatId, user_id: UserId) -> Result<bool, StoreError> {
        let mut conn = self.db.get().await?;

        let found: Option<i64> = diesel_async::RunQueryDsl::get_result(
            chat_members::table
                .filter(chat_members::chat_id.eq(chat_id))
                .filter(chat_members::user_id.eq(user_id))
                .select(chat_members::user_id),
            &mut conn,
        )
        .await
        .optional()?;

        Ok(found.is_some())
    }

    async fn chat_by_id(&self, chat_id: ChatId) -> Result<Chat, StoreError> {
        let mut conn = self.db.get().await?;

        let row: ChatRow = diesel_async::RunQueryDsl::get_result(
            chats::table.find(chat_id).select(ChatRow::as_select()),
            &mut conn,
        )
        .await
        .optional()?
        .ok_or(StoreError::NotFound("chat"))?;

        row.try_into()
    }

    async fn user_by_id(&self, user_id: UserId) -> Result<UserProfile, StoreError> {
        let mut conn = self.db.get().await?;

        let user: User = diesel_async::RunQueryDsl::get_result(
            users::table.find(user_id).select(User::as_select()),
            &mut conn,
        )
        .await
        .optional()?
        .ok_or(StoreError::NotFound("user"))?;

        Ok(user.into())
    }

    async fn persist_message(&self, message: NewChatMessage) -> Result<StoredMessage, StoreError> {
        let mut conn = self.db.get().await?;

        let row: Message = diesel_async::RunQueryDsl::get_result(
            diesel::insert_into(messages::table)
                .values(NewMessage {
                    id: self.snowflake.generate(),
                    chat_id: message.chat_id,
                    user_id: message.user_id,
                    content: &message.content,
                    kind: &message.kind,
                    created_at: Utc::now(),
                })
                .returning(Message::as_returning()),
            &mut conn,
        )
        .await?;

        Ok(row.into())
    }

    async fn update_chat_activity(
        &self,
        chat_id: ChatId,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut conn = self.db.get().await?;

        let updated = diesel_async::RunQueryDsl::execute(
            diesel::update(chats::table.find(chat_id)).set(chats::last_activity_at.eq(at)),
            &mut conn,
        )
        .await?;

        if updated == 0 {
            return Err(StoreError::NotFound("chat"));
        }
        Ok(())
    }

    async fn message_by_id(&self, message_id: MessageId) -> Result<StoredMessage, StoreError> {
        let mut conn = self.db.get().await?;

        let row: Message = diesel_async::RunQueryDsl::get_result(
            messages::table.find(message_id).select(Message::as_select()),
            &mut conn,
        )
        .await
        .optional()?
        .ok_or(StoreError::NotFound("message"))?;

        Ok(row.into())
    }

    async fn mark_message_read(
        &self,
        message_id: MessageId,
        user_id: UserId,
    ) -> Result<(), StoreError> {
        let mut conn = self.db.get().await?;

        diesel_async::RunQueryDsl::execute(
            diesel::insert_into(message_reads::table)
                .values(NewMessageRead {
                    message_id,
                    user_id,
                    read_at: Utc::now(),
                })
                .on_conflict((message_reads::message_id, message_reads::user_id))
                .do_nothing(),
            &mut conn,
        )
        .await?;

        Ok(())
    }
}
