use std::time::Duration;

use crate::gateway::keepalive::KeepalivePolicy;

/// Default idle window before a silent peer is considered dead.
const DEFAULT_PONG_WAIT_SECS: u64 = 60;
/// Default deadline for a single socket write.
const DEFAULT_WRITE_WAIT_SECS: u64 = 10;
/// Default upper bound for one inbound frame.
const DEFAULT_MAX_MESSAGE_BYTES: usize = 10 * 1024;
/// Default outbound queue capacity per session.
const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Gateway configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string. When unset the gateway runs on the
    /// in-memory store.
    pub database_url: Option<String>,
    /// HMAC secret used to validate bearer JWTs.
    pub jwt_secret: String,
    /// Base64-encoded AES key for at-rest message encryption.
    pub encryption_key: String,
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Whether to join the cross-instance relay.
    pub redis_enabled: bool,
    /// Redis connection string for the relay.
    pub redis_url: String,
    /// Label for this process in relayed envelopes.
    pub instance_id: String,
    /// Per-connection tuning.
    pub gateway: GatewaySettings,
}

/// Per-connection tunables for the WebSocket gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub keepalive: KeepalivePolicy,
    /// Largest inbound frame accepted before the read fails.
    pub max_message_bytes: usize,
    /// Bounded outbound queue capacity per session.
    pub outbound_capacity: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            keepalive: KeepalivePolicy::from_idle_window(
                Duration::from_secs(DEFAULT_PONG_WAIT_SECS),
                Duration::from_secs(DEFAULT_WRITE_WAIT_SECS),
            ),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

impl Config {
    /// `DATABASE_URL`, treating an empty value as unset.
    pub fn database_url_from_env() -> Option<String> {
        optional_var("DATABASE_URL")
    }

    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing or
    /// malformed.
    pub fn from_env() -> Self {
        let jwt_secret = required_var("JWT_SECRET");
        if jwt_secret.len() < 32 {
            panic!("JWT_SECRET must be at least 32 bytes");
        }

        let keepalive = KeepalivePolicy::from_idle_window(
            Duration::from_secs(parsed_var("WS_PONG_WAIT_SECS", DEFAULT_PONG_WAIT_SECS)),
            Duration::from_secs(parsed_var("WS_WRITE_WAIT_SECS", DEFAULT_WRITE_WAIT_SECS)),
        );

        Self {
            database_url: Self::database_url_from_env(),
            jwt_secret,
            encryption_key: required_var("ENCRYPTION_KEY"),
            port: parsed_var("PORT", 8080),
            redis_enabled: parsed_var("REDIS_ENABLED", false),
            redis_url: optional_var("REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379/0".to_string()),
            instance_id: optional_var("INSTANCE_ID").unwrap_or_else(|| {
                messenger_common::id::prefixed_ulid(messenger_common::id::prefix::INSTANCE)
            }),
            gateway: GatewaySettings {
                keepalive,
                max_message_bytes: parsed_var("WS_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES),
                outbound_capacity: parsed_var("WS_OUTBOUND_CAPACITY", DEFAULT_OUTBOUND_CAPACITY)
                    .max(1),
            },
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match optional_var(name) {
        Some(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{name} env var has an invalid value: {raw}")),
        None => default,
    }
}
