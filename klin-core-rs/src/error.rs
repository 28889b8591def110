//! Error types for KLIN
//!
//! Protocol behaviour never fails: timeouts, silence and expired messages
//! are all recovery paths. Errors only surface at the edges, when a
//! configuration is rejected or a message cannot be decoded.

use thiserror::Error;

/// Errors produced by the core library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Message codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
