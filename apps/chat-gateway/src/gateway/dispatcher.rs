//! Fan-out of chat events to the live sessions of chat members.
//!
//! One encoding per event is shared by every recipient. Delivery never
//! blocks: a member whose queue is full is evicted and the rest still
//! receive the frame. When the relay is enabled, each locally originated
//! event is published exactly once for the other instances.

use std::sync::Arc;

use messenger_common::{ChatId, UserId};
use serde::Serialize;

use crate::db::store::{ChatKind, ChatStore, StoreError};

use super::events::{ChatEvent, Frame};
use super::registry::{ConnectionRegistry, Delivery};
use super::relay::{channel, RecipientHint, Relay, RelayEnvelope};
use super::session::Session;

/// Per-dispatch delivery counts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    /// Frames queued on a live session.
    pub delivered: usize,
    /// Recipients without a session on this instance.
    pub offline: usize,
    /// Recipients evicted for a full queue (or found already closing).
    pub evicted: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct Dispatcher {
    store: Arc<dyn ChatStore>,
    registry: Arc<ConnectionRegistry>,
    relay: Option<Arc<Relay>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<ConnectionRegistry>,
        relay: Option<Arc<Relay>>,
    ) -> Self {
        Self {
            store,
            registry,
            relay,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn relay_enabled(&self) -> bool {
        self.relay.is_some()
    }

    /// Deliver `event` to every member of `chat_id` except `author`, then
    /// publish it once to the relay. The publish happens even when local
    /// membership cannot be resolved; other instances resolve it themselves.
    pub async fn dispatch(
        &self,
        chat_id: ChatId,
        author: UserId,
        event: &ChatEvent,
    ) -> Result<DispatchReport, DispatchError> {
        let payload = event.payload()?;
        let members = self.store.chat_members(chat_id).await;

        let report = match &members {
            Ok(members) => {
                let frame = Frame::envelope(event.kind(), &payload);
                let recipients: Vec<UserId> =
                    members.iter().copied().filter(|id| *id != author).collect();
                let report = self.deliver_local(&recipients, &frame);
                tracing::debug!(
                    chat_id,
                    author,
                    event = event.kind(),
                    delivered = report.delivered,
                    offline = report.offline,
                    evicted = report.evicted,
                    "dispatched chat event"
                );
                report
            }
            Err(err) => {
                tracing::error!(?err, chat_id, "failed to resolve chat members");
                DispatchReport::default()
            }
        };

        if let Some(relay) = &self.relay {
            let channel = match &members {
                Ok(members) => self.channel_for(chat_id, members).await,
                Err(_) => channel::group(chat_id),
            };
            let envelope =
                RelayEnvelope::new(event.kind(), RecipientHint::Chat(chat_id), author, payload);
            relay.publish(&channel, envelope).await;
        }

        if let Err(err) = members {
            return Err(err.into());
        }
        Ok(report)
    }

    /// Deliver an envelope received from another instance. Local only.
    pub async fn deliver_relayed(
        &self,
        envelope: &RelayEnvelope,
    ) -> Result<DispatchReport, DispatchError> {
        let frame = Frame::envelope(&envelope.event_type, &envelope.payload);

        let recipients = match envelope.recipient {
            RecipientHint::User(user_id) => vec![user_id],
            RecipientHint::Chat(chat_id) => self
                .store
                .chat_members(chat_id)
                .await?
                .into_iter()
                .filter(|id| *id != envelope.sender_id)
                .collect(),
        };

        Ok(self.deliver_local(&recipients, &frame))
    }

    /// Send an event straight to one session (echoes, errors, greetings).
    pub fn reply(&self, session: &Arc<Session>, event: &ChatEvent) -> Delivery {
        match event.to_frame() {
            Ok(frame) => self.registry.deliver(session, frame),
            Err(err) => {
                tracing::error!(?err, event = event.kind(), "failed to encode reply");
                Delivery::Closed
            }
        }
    }

    fn deliver_local(&self, recipients: &[UserId], frame: &Frame) -> DispatchReport {
        let mut report = DispatchReport {
            offline: recipients.len(),
            ..Default::default()
        };

        self.registry.for_each_member(recipients, |session| {
            report.offline -= 1;
            match self.registry.deliver(session, frame.clone()) {
                Delivery::Queued => report.delivered += 1,
                Delivery::Evicted | Delivery::Closed => report.evicted += 1,
            }
        });

        report
    }

    /// Direct chats with exactly two members use the symmetric private
    /// channel; everything else, including lookup failures, uses the group
    /// channel.
    async fn channel_for(&self, chat_id: ChatId, members: &[UserId]) -> String {
        match self.store.chat_by_id(chat_id).await {
            Ok(chat) if chat.kind == ChatKind::Private && members.len() == 2 => {
                channel::private(members[0], members[1])
            }
            Ok(_) => channel::group(chat_id),
            Err(err) => {
                tracing::warn!(?err, chat_id, "chat lookup failed, using group channel");
                channel::group(chat_id)
            }
        }
    }
}
