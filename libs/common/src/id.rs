use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = messenger_common::id::prefixed_ulid("conn");
/// assert!(id.starts_with("conn_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// One live duplex connection (the session's connection handle).
    pub const CONNECTION: &str = "conn";
    /// One running gateway process, used to tag relayed envelopes.
    pub const INSTANCE: &str = "inst";
}
