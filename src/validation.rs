//! Node identifier parsing and display-name sanitization.
//!
//! Meshtastic identifies nodes by a 32-bit number that shows up in three spellings:
//! a JSON number (`305419896`), the "user id" form with a bang prefix (`!12345678`), and
//! bare hex in MQTT topic segments (`12345678`). Strings are always read as hex, so a
//! digit-only string like `12345678` is `0x12345678`; decimal is only accepted as a JSON
//! number. Everything that lands in the store is normalised to `u32` here.

/// Node ID parsing errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NodeIdError {
    #[error("node id is empty")]
    Empty,

    #[error("node id '{0}' is not valid hex")]
    InvalidHex(String),

    #[error("node id '{0}' does not fit in 32 bits")]
    OutOfRange(String),
}

/// Parse a node id written as hex, with or without the leading `!` (`!a1b2c3d4`, `a1b2c3d4`).
pub fn parse_node_id(raw: &str) -> Result<u32, NodeIdError> {
    let trimmed = raw.trim();
    let hex = trimmed.strip_prefix('!').unwrap_or(trimmed);
    if hex.is_empty() {
        return Err(NodeIdError::Empty);
    }
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(NodeIdError::InvalidHex(trimmed.to_string()));
    }
    u32::from_str_radix(hex, 16).map_err(|_| NodeIdError::OutOfRange(trimmed.to_string()))
}

/// Resolve a JSON route/neighbor entry to a node id.
///
/// Numbers are taken verbatim; strings use the hex form accepted by [`parse_node_id`].
pub fn node_id_from_json(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        serde_json::Value::String(s) => parse_node_id(s).ok(),
        _ => None,
    }
}

/// Canonical `!xxxxxxxx` spelling used in logs.
pub fn format_node_id(id: u32) -> String {
    format!("!{:08x}", id)
}

/// Sanitize a node display name: drop non-ASCII and control characters, collapse runs of
/// whitespace into a single space and trim the ends. Returns `None` when nothing printable remains.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let ascii: String = raw
        .chars()
        .filter(|c| c.is_ascii() && (!c.is_ascii_control() || c.is_ascii_whitespace()))
        .collect();
    let collapsed = ascii.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}
