use ulid::Ulid;

/// `<prefix>_<ulid>`, sortable by creation time.
///
/// # Examples
/// ```
/// let id = roomcast_common::id::prefixed_ulid("ses");
/// assert!(id.starts_with("ses_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{prefix}_{}", Ulid::new())
}

/// Prefixes for ids minted by the gateway.
pub mod prefix {
    /// Gateway session, survives reconnects.
    pub const SESSION: &str = "ses";
    /// One live transport link.
    pub const CONNECTION: &str = "conn";
    /// One gateway process, used to tag published messages.
    pub const NODE: &str = "node";
    /// Handler failure reported to a client.
    pub const ERROR: &str = "err";
}
