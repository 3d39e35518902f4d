//! Error types for the replication value-type layer.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtoError`].
pub type Result<T, E = ProtoError> = std::result::Result<T, E>;

/// Parse failures for the persisted/wire string forms.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtoError {
    /// Not a 24-hex-character change number.
    #[error("invalid change number: {0:?}")]
    InvalidChangeNumber(String),

    /// Not a parseable distinguished name.
    #[error("invalid DN: {0:?}")]
    InvalidDn(String),
}
