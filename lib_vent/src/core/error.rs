//! # Arbitration Rejections
//!
//! Two terminal outcomes for a request the engine refuses:
//!
//! - **`Prohibited`**: physically or operationally unsafe, whoever asks.
//! - **`NotAuthorized`**: safe in principle, but needs a `Local` (trusted) origin.
//!
//! Neither is retried. The canonical state is left untouched and the reason is
//! returned only to the client that asked.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why the arbitration engine refused a state or lock change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArbitrationError {
    /// The transition is unsafe regardless of who requested it.
    #[error("prohibited: {0}")]
    Prohibited(&'static str),
    /// The transition needs a trusted (`Local`) origin.
    #[error("not authorized: {0}")]
    NotAuthorized(&'static str),
}

/// The wire classification of an [`ArbitrationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Serialized as `"prohibited"`.
    #[serde(rename = "prohibited")]
    Prohibited,
    /// Serialized as `"notauthorized"`.
    #[serde(rename = "notauthorized")]
    NotAuthorized,
}

impl ArbitrationError {
    /// Returns the classification used on the websocket wire.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Prohibited(_) => ErrorKind::Prohibited,
            Self::NotAuthorized(_) => ErrorKind::NotAuthorized,
        }
    }

    /// Returns the human readable reason shown to the operator.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Prohibited(msg) | Self::NotAuthorized(msg) => msg,
        }
    }
}
