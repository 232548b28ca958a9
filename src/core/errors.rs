// src/core/errors.rs

//! Defines the primary error type for the client library.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the client.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
///
/// Most command-facing APIs deliberately do not return this type: a request
/// that times out or receives a malformed acknowledgement resolves to an
/// absent value, and a failed connect resolves to `false`. `KeySyncError` is
/// reserved for the paths where a concrete cause is actionable: the wire
/// codec, the transport, and the bootstrap exchange.
#[derive(Error, Debug, Clone)]
pub enum KeySyncError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Frame exceeds maximum length ({0} bytes)")]
    FrameTooLarge(usize),

    #[error("Invalid endpoint address: {0}")]
    InvalidEndpoint(String),

    #[error("Bootstrap Error: {0}")]
    Bootstrap(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),
}

impl From<std::io::Error> for KeySyncError {
    fn from(err: std::io::Error) -> Self {
        KeySyncError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for KeySyncError {
    fn from(err: serde_json::Error) -> Self {
        KeySyncError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for KeySyncError {
    fn from(err: reqwest::Error) -> Self {
        KeySyncError::HttpClientError(err.to_string())
    }
}
