//! Applies the chat schema migrations to `DATABASE_URL`.
//!
//! Usage:
//!   cargo run -p chat-gateway --bin chat-migrate

use std::path::Path;
use std::process::ExitCode;

use chat_gateway::config::Config;
use chat_gateway::db::migrations;

fn main() -> ExitCode {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match migrations::run_pending(Config::database_url_from_env().as_deref()) {
        Ok(applied) if applied.is_empty() => {
            tracing::info!("no pending migrations");
            ExitCode::SUCCESS
        }
        Ok(applied) => {
            for version in &applied {
                tracing::info!(%version, "applied migration");
            }
            tracing::info!(count = applied.len(), "migrations applied");
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!(%err, "migration failed");
            ExitCode::FAILURE
        }
    }
}
