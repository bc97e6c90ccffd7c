use thiserror::Error;

/// Errors raised by the sled-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Wrapper around sled's error type.
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Directory creation and similar.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A key in a time-ordered tree did not have the expected layout.
    #[error("corrupt key in tree '{tree}' ({len} bytes)")]
    CorruptKey { tree: &'static str, len: usize },
}
