pub mod auth;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use auth::tokens::TokenVerifier;
use config::Config;
use crypto::{CipherError, MessageCipher};
use db::store::ChatStore;
use gateway::dispatcher::Dispatcher;
use gateway::handler::InboundHandler;
use gateway::registry::ConnectionRegistry;
use gateway::relay::Relay;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub tokens: Arc<TokenVerifier>,
    pub config: Arc<Config>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub handler: Arc<InboundHandler>,
}

impl AppState {
    /// Wire the gateway components together. `relay` is `None` when the
    /// process runs single-instance.
    pub fn new(
        config: Config,
        store: Arc<dyn ChatStore>,
        relay: Option<Arc<Relay>>,
    ) -> Result<Self, CipherError> {
        let cipher = Arc::new(MessageCipher::from_base64(&config.encryption_key)?);
        let tokens = Arc::new(TokenVerifier::new(&config.jwt_secret));
        let registry = Arc::new(ConnectionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), registry.clone(), relay));
        let handler = Arc::new(InboundHandler::new(
            store.clone(),
            cipher,
            dispatcher.clone(),
        ));

        Ok(Self {
            store,
            tokens,
            config: Arc::new(config),
            registry,
            dispatcher,
            handler,
        })
    }
}
