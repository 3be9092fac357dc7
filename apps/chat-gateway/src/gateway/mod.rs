//! Real-time core: sessions, registry, dispatch, cross-instance relay.

pub mod dispatcher;
pub mod events;
pub mod handler;
pub mod keepalive;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
