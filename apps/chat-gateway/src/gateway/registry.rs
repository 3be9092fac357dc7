//! Process-wide map from user to their live session.
//!
//! At most one session per user on this instance. All mutations are single
//! `DashMap` operations, so a lookup only waits on the shard holding that
//! user, and never on delivery.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use messenger_common::UserId;

use super::events::Frame;
use super::session::{Session, SessionError};

/// Outcome of handing a frame to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The queue was full; the session has been closed and unregistered.
    Evicted,
    /// The session was already closing.
    Closed,
}

/// Shared registry of live gateway sessions, keyed by user.
pub struct ConnectionRegistry {
    sessions: DashMap<UserId, Arc<Session>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Register a session, replacing any existing one for the same user.
    ///
    /// The replaced session is closed while its shard is still locked, so no
    /// reader can observe two live sessions for one user.
    pub fn register(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        match self.sessions.entry(session.user_id) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(session);
                previous.close();
                Some(previous)
            }
            Entry::Vacant(entry) => {
                entry.insert(session);
                None
            }
        }
    }

    /// Remove `session` if, and only if, it is still the registered one.
    pub fn unregister(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(&session.user_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn lookup(&self, user_id: UserId) -> Option<Arc<Session>> {
        self.sessions.get(&user_id).map(|entry| entry.value().clone())
    }

    /// Snapshot the live sessions of the given users. The map is not held
    /// once this returns.
    pub fn sessions_for(&self, user_ids: &[UserId]) -> Vec<Arc<Session>> {
        user_ids.iter().filter_map(|id| self.lookup(*id)).collect()
    }

    /// Run `f` over the live sessions of `user_ids`, outside any map lock.
    pub fn for_each_member<F>(&self, user_ids: &[UserId], mut f: F)
    where
        F: FnMut(&Arc<Session>),
    {
        for session in self.sessions_for(user_ids) {
            f(&session);
        }
    }

    /// Enqueue a frame on `session`. A full queue evicts the session.
    pub fn deliver(&self, session: &Arc<Session>, frame: Frame) -> Delivery {
        match session.enqueue(frame) {
            Ok(()) => Delivery::Queued,
            Err(SessionError::Full) => {
                tracing::warn!(
                    user_id = session.user_id,
                    connection_id = %session.connection_id,
                    "outbound queue full, evicting session"
                );
                self.unregister(session);
                session.close();
                Delivery::Evicted
            }
            Err(_) => {
                self.unregister(session);
                Delivery::Closed
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
