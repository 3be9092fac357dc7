use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use chat_gateway::config::Config;
use chat_gateway::db::pg::PgChatStore;
use chat_gateway::db::store::{ChatStore, MemoryChatStore};
use chat_gateway::gateway::relay::{PubSubBroker, RedisBroker, Relay};
use chat_gateway::AppState;
use messenger_common::SnowflakeGenerator;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing, env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer)
        .init();

    let config = Config::from_env();
    let port = config.port;

    let snowflake = Arc::new(SnowflakeGenerator::for_instance(&config.instance_id));

    let store: Arc<dyn ChatStore> = match &config.database_url {
        Some(url) => Arc::new(PgChatStore::new(
            chat_gateway::db::pool::connect(url),
            snowflake,
        )),
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Arc::new(MemoryChatStore::new(snowflake))
        }
    };

    // The relay is optional: a broker outage degrades to local-only delivery.
    let relay = if config.redis_enabled {
        match RedisBroker::connect(&config.redis_url).await {
            Ok(broker) => {
                let broker: Arc<dyn PubSubBroker> = Arc::new(broker);
                Some(Arc::new(Relay::new(broker, config.instance_id.clone())))
            }
            Err(err) => {
                tracing::warn!(?err, "relay unavailable, running local-only");
                None
            }
        }
    } else {
        None
    };

    tracing::info!(
        instance_id = %config.instance_id,
        relay = relay.is_some(),
        "chat-gateway configured"
    );

    let state = AppState::new(config, store, relay.clone()).expect("invalid ENCRYPTION_KEY");

    if let Some(relay) = &relay {
        relay.spawn_subscriber(state.dispatcher.clone());
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .merge(chat_gateway::routes::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "chat-gateway listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
