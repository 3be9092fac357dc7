//! Inbound frame handling: decode into actions and apply them.

use std::ops::ControlFlow;
use std::sync::Arc;

use messenger_common::{ChatId, MessageId, UserId};

use crate::crypto::MessageCipher;
use crate::db::store::{ChatStore, NewChatMessage, StoreError, StoredMessage, UserProfile};

use super::dispatcher::{DispatchError, DispatchReport, Dispatcher};
use super::events::{
    self, ChatEvent, ClientError, FrameError, InboundFrame, MessageView, ReadReceipt, SenderView,
    TypingStatus,
};
use super::session::Session;

/// A domain action requested by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendMessage {
        chat_id: ChatId,
        content: String,
        kind: String,
    },
    Typing {
        chat_id: ChatId,
        status: bool,
    },
    MarkRead {
        message_id: MessageId,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The frame could not be read at all. The connection is dropped.
    #[error("malformed frame envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    /// The frame was understood but refused. Reported to the client.
    #[error(transparent)]
    Rejected(#[from] ClientError),
}

/// Turn one raw inbound frame from `user_id` into an action.
pub fn ingest(user_id: UserId, raw: &[u8]) -> Result<Action, IngestError> {
    if user_id <= 0 {
        return Err(ClientError::unauthorized("not authenticated").into());
    }

    let frame = events::decode(raw).map_err(|err| match err {
        FrameError::Envelope(source) => IngestError::Envelope(source),
        FrameError::Payload { kind, .. } => {
            ClientError::bad_request(format!("invalid {kind} payload")).into()
        }
    })?;

    match frame {
        InboundFrame::Message(payload) => {
            if payload.content.trim().is_empty() {
                return Err(ClientError::bad_request("message content is required").into());
            }
            Ok(Action::SendMessage {
                chat_id: payload.chat_id,
                content: payload.content,
                kind: payload.kind,
            })
        }
        InboundFrame::Typing(payload) => Ok(Action::Typing {
            chat_id: payload.chat_id,
            status: payload.status,
        }),
        InboundFrame::Read(payload) => Ok(Action::MarkRead {
            message_id: payload.message_id,
        }),
        InboundFrame::Unknown { kind } => {
            Err(ClientError::bad_request(format!("unknown message type: {kind}")).into())
        }
    }
}

/// Applies client actions against storage and fans the results out.
pub struct InboundHandler {
    store: Arc<dyn ChatStore>,
    cipher: Arc<MessageCipher>,
    dispatcher: Arc<Dispatcher>,
}

impl InboundHandler {
    pub fn new(
        store: Arc<dyn ChatStore>,
        cipher: Arc<MessageCipher>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            cipher,
            dispatcher,
        }
    }

    /// Handle one frame from `session`. Breaks only when the connection must
    /// be torn down; client mistakes are answered with an `error` frame.
    pub async fn handle_frame(&self, session: &Arc<Session>, raw: &[u8]) -> ControlFlow<()> {
        let result = match ingest(session.user_id, raw) {
            Ok(action) => self.apply(session, action).await,
            Err(IngestError::Envelope(err)) => {
                tracing::debug!(?err, user_id = session.user_id, "undecodable frame, closing");
                return ControlFlow::Break(());
            }
            Err(IngestError::Rejected(err)) => Err(err),
        };

        if let Err(err) = result {
            tracing::debug!(
                user_id = session.user_id,
                code = err.code,
                message = %err.message,
                "rejected client frame"
            );
            self.dispatcher.reply(session, &ChatEvent::Error(err));
        }
        ControlFlow::Continue(())
    }

    pub async fn apply(&self, session: &Arc<Session>, action: Action) -> Result<(), ClientError> {
        match action {
            Action::SendMessage {
                chat_id,
                content,
                kind,
            } => self.send_message(session, chat_id, content, kind).await,
            Action::Typing { chat_id, status } => {
                self.typing(session.user_id, chat_id, status).await
            }
            Action::MarkRead { message_id } => self.mark_read(session.user_id, message_id).await,
        }
    }

    async fn send_message(
        &self,
        session: &Arc<Session>,
        chat_id: ChatId,
        content: String,
        kind: String,
    ) -> Result<(), ClientError> {
        let user_id = session.user_id;
        self.require_member(chat_id, user_id).await?;

        self.store.chat_by_id(chat_id).await.map_err(|err| {
            if err.is_not_found() {
                ClientError::not_found("chat not found")
            } else {
                storage_failure(err)
            }
        })?;

        let sender = self
            .store
            .user_by_id(user_id)
            .await
            .map_err(storage_failure)?;

        let sealed = self.cipher.encrypt(content.as_bytes()).map_err(|err| {
            tracing::error!(?err, "message encryption failed");
            ClientError::internal("failed to encrypt message")
        })?;

        let stored = self
            .store
            .persist_message(NewChatMessage {
                chat_id,
                user_id,
                content: sealed,
                kind,
            })
            .await
            .map_err(storage_failure)?;

        if let Err(err) = self.store.update_chat_activity(chat_id, stored.created_at).await {
            tracing::error!(?err, chat_id, "failed to update chat activity");
        }

        let event = ChatEvent::NewMessage(message_view(&stored, content, sender.into()));

        self.dispatcher.reply(session, &event);
        self.dispatch_logged(chat_id, user_id, &event).await;
        Ok(())
    }

    async fn typing(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        status: bool,
    ) -> Result<(), ClientError> {
        self.require_member(chat_id, user_id).await?;

        let event = ChatEvent::TypingStatus(TypingStatus {
            user_id,
            chat_id,
            status,
        });
        self.dispatch_logged(chat_id, user_id, &event).await;
        Ok(())
    }

    async fn mark_read(&self, user_id: UserId, message_id: MessageId) -> Result<(), ClientError> {
        let message = self.store.message_by_id(message_id).await.map_err(|err| {
            if err.is_not_found() {
                ClientError::not_found("message not found")
            } else {
                storage_failure(err)
            }
        })?;

        self.require_member(message.chat_id, user_id).await?;

        self.store
            .mark_message_read(message_id, user_id)
            .await
            .map_err(storage_failure)?;

        let event = ChatEvent::ReadReceipt(ReadReceipt {
            user_id,
            message_id,
            chat_id: message.chat_id,
        });
        self.dispatch_logged(message.chat_id, user_id, &event).await;
        Ok(())
    }

    /// Deliver a message that was persisted by another component (for
    /// example an HTTP upload) to the chat's live members.
    pub async fn dispatch_stored(
        &self,
        stored: StoredMessage,
    ) -> Result<DispatchReport, DispatchError> {
        let sender = self.store.user_by_id(stored.user_id).await?;
        let content = self
            .cipher
            .decrypt_text(&stored.content)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;

        let event = ChatEvent::NewMessage(message_view(&stored, content, sender.into()));
        self.dispatcher
            .dispatch(stored.chat_id, stored.user_id, &event)
            .await
    }

    async fn require_member(&self, chat_id: ChatId, user_id: UserId) -> Result<(), ClientError> {
        match self.store.is_member(chat_id, user_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ClientError::forbidden("access denied")),
            Err(err) => Err(storage_failure(err)),
        }
    }

    async fn dispatch_logged(&self, chat_id: ChatId, author: UserId, event: &ChatEvent) {
        if let Err(err) = self.dispatcher.dispatch(chat_id, author, event).await {
            tracing::error!(?err, chat_id, event = event.kind(), "dispatch failed");
        }
    }
}

fn storage_failure(err: StoreError) -> ClientError {
    tracing::error!(?err, "storage error");
    ClientError::internal("internal server error")
}

fn message_view(stored: &StoredMessage, content: String, user: SenderView) -> MessageView {
    MessageView {
        id: stored.id,
        chat_id: stored.chat_id,
        user_id: stored.user_id,
        content,
        kind: stored.kind.clone(),
        created_at: stored.created_at,
        user,
    }
}

impl From<UserProfile> for SenderView {
    fn from(profile: UserProfile) -> Self {
        Self {
            id: profile.id,
            username: profile.username,
            avatar: profile.avatar,
        }
    }
}
