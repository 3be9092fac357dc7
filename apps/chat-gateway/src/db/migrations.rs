//! Embedded schema migrations for the PostgreSQL store.

use diesel::pg::PgConnection;
use diesel::Connection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations");

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("DATABASE_URL is not set; the gateway is running on the in-memory store")]
    NoDatabase,
    #[error("failed to connect to database: {0}")]
    Connect(#[from] diesel::result::ConnectionError),
    #[error("failed to run migrations: {0}")]
    Run(String),
}

/// Apply every pending migration. Returns the names of the ones applied.
pub fn run_pending(database_url: Option<&str>) -> Result<Vec<String>, MigrateError> {
    let database_url = database_url.ok_or(MigrateError::NoDatabase)?;
    let mut conn = PgConnection::establish(database_url)?;

    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|err| MigrateError::Run(err.to_string()))?;

    Ok(applied.iter().map(|version| version.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use diesel::pg::Pg;
    use diesel::migration::MigrationSource;

    use super::*;

    #[test]
    fn chat_tables_migration_is_embedded() {
        let migrations = MigrationSource::<Pg>::migrations(&MIGRATIONS).unwrap();
        let names: Vec<String> = migrations.iter().map(|m| m.name().to_string()).collect();
        assert!(
            names.iter().any(|name| name.contains("create_chat_tables")),
            "embedded: {names:?}"
        );
    }

    #[test]
    fn missing_database_url_is_reported() {
        let err = run_pending(None).unwrap_err();
        assert!(matches!(err, MigrateError::NoDatabase));
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
