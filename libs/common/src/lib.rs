pub mod id;
pub mod snowflake;

pub use snowflake::SnowflakeGenerator;

/// Storage-assigned user identifier.
pub type UserId = i64;

/// Storage-assigned chat identifier.
pub type ChatId = i64;

/// Snowflake message identifier.
pub type MessageId = i64;
