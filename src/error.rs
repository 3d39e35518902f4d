//! Unified error handling for dirsync.
//!
//! This module provides the error hierarchy for the replication engine,
//! with automatic conversions and metric labeling.

use dirsync_proto::{ChangeNumber, ProtoError, ResultCode};
use thiserror::Error;

// ============================================================================
// Historical-ledger errors (persisted attribute decoding)
// ============================================================================

/// Errors raised while decoding one persisted historical line.
///
/// Decoding an entry never fails as a whole; these are reported per line and
/// the line is skipped.
#[derive(Debug, Error)]
pub enum HistoricalError {
    #[error("malformed historical line: {0}")]
    MalformedLine(String),

    #[error("attribute not in schema: {0}")]
    UnknownAttribute(String),
}

impl HistoricalError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::MalformedLine(_) => "malformed_line",
            Self::UnknownAttribute(_) => "unknown_attribute",
        }
    }
}

// ============================================================================
// Replay errors (applying remote updates)
// ============================================================================

/// Errors that can occur while replaying a remote update.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The backend refused the operation with an LDAP result code the
    /// resolver does not handle; the update is parked for a repair tool.
    #[error("unresolvable result {code:?} replaying {csn}")]
    Unresolved { csn: ChangeNumber, code: ResultCode },

    /// The per-update retry bound was reached without convergence.
    #[error("retry bound of {attempts} reached replaying {csn}")]
    RetriesExhausted { csn: ChangeNumber, attempts: u32 },

    /// The backend itself failed (storage, not semantics).
    #[error("backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl ReplayError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Unresolved { .. } => "unresolved",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Backend(_) => "backend_error",
            Self::Proto(_) => "proto_error",
        }
    }
}

// ============================================================================
// Configuration errors
// ============================================================================

/// Errors loading or validating the replica configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Get a static error code string for metrics labeling.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Parse(_) => "parse_error",
            Self::Invalid(_) => "invalid",
        }
    }
}
