//! Error types for the bridge.
//!
//! Failures fall into two tiers. **Load-bearing** failures (tunnel connect,
//! host transport) are returned as [`BridgeError`] and must be handled by the
//! caller, because they decide whether the connection directory is correct.
//! **Best-effort** failures (storage I/O, prompt replies on the cancel path,
//! tunnel teardown) are carried in typed reports such as
//! [`crate::storage::FlushReport`] and [`crate::tunnel::Teardown`] and are
//! logged where they occur.

use thiserror::Error;

/// Errors crossing the host process boundary or affecting routing state.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The host answered the request with an error message.
    #[error("host error: {0}")]
    Host(String),
    /// The host process went away before answering.
    #[error("host connection closed")]
    HostClosed,
    /// The host sent something we could not understand.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A URL returned by the host (or given by the caller) has no usable origin.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors from a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid namespace {0:?}")]
    InvalidNamespace(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt store file: {0}")]
    Corrupt(#[from] serde_json::Error),
    /// Backend refused the operation (used by test and custom backends).
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the fetch router.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("relative URL {0:?} with no base URL recorded")]
    RelativeWithoutBase(String),
    #[error("invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("no response headers within {0:?}")]
    Timeout(std::time::Duration),
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid JSON body: {0}")]
    Decode(#[from] serde_json::Error),
}
