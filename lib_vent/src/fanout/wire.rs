//! # Websocket Wire Format
//!
//! Every message in either direction is an envelope `{"ctx": <context>, "data": <payload>}`.
//!
//! ## Contexts:
//!
//! - **`ventchange`**: in, a requested state; out, the canonical state.
//! - **`lockchange`**: in only, `{"LaserLock":bool}` and/or `{"OLGALock":bool}`.
//! - **`error`**: out only, `{"Type":"prohibited"|"notauthorized","Msg":..}`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::error::{ArbitrationError, ErrorKind};
use crate::core::model::{LockKind, Reply, VentilationState};

/// Context of state messages.
pub const CTX_VENTCHANGE: &str = "ventchange";
/// Context of lock change requests.
pub const CTX_LOCKCHANGE: &str = "lockchange";
/// Context of rejection messages.
pub const CTX_ERROR: &str = "error";
/// Largest inbound text message accepted, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 512;

/// What a connecting client sees before any state has been accepted.
pub const INITIAL_SNAPSHOT: &str = r#"{"ctx":"ventchange","data":{}}"#;

/// Errors raised while encoding or decoding websocket messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// Not JSON, or not the expected shape.
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The envelope names a context this server does not handle.
    #[error("unknown context '{0}'")]
    UnknownContext(String),

    /// A lock change without any lock field.
    #[error("lock change names no lock")]
    EmptyLockChange,

    /// The message exceeds [`MAX_MESSAGE_SIZE`].
    #[error("message of {0} bytes exceeds the limit of {MAX_MESSAGE_SIZE}")]
    TooLarge(usize),
}

#[derive(Serialize)]
struct Outbound<'a, T: Serialize> {
    ctx: &'a str,
    data: T,
}

#[derive(Deserialize)]
struct Inbound {
    ctx: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    #[serde(rename = "Type")]
    kind: ErrorKind,
    #[serde(rename = "Msg")]
    msg: &'a str,
}

#[derive(Deserialize)]
struct LockPayload {
    #[serde(rename = "LaserLock")]
    laser: Option<bool>,
    #[serde(rename = "OLGALock")]
    olga: Option<bool>,
}

/// A decoded client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Proposed ventilation state. Lock flags in it are ignored.
    ChangeVentilation(VentilationState),
    /// One or both lock flags to set, in `LockKind::ALL` order.
    ChangeLocks(Vec<(LockKind, bool)>),
}

/// Encodes a canonical state as a `ventchange` message.
pub fn encode_state(state: &VentilationState) -> Result<Arc<str>, WireError> {
    Ok(serde_json::to_string(&Outbound { ctx: CTX_VENTCHANGE, data: state })?.into())
}

/// Encodes a rejection as an `error` message.
pub fn encode_error(err: &ArbitrationError) -> Result<Arc<str>, WireError> {
    let data = ErrorPayload { kind: err.kind(), msg: err.message() };
    Ok(serde_json::to_string(&Outbound { ctx: CTX_ERROR, data })?.into())
}

/// Encodes a private reply from the arbitration engine.
pub fn encode_reply(reply: &Reply) -> Result<Arc<str>, WireError> {
    match reply {
        Reply::State(state) => encode_state(state),
        Reply::Error(err) => encode_error(err),
    }
}

/// # Decode Client Message
///
/// Parses one inbound text message.
pub fn decode_client_message(text: &str) -> Result<ClientCommand, WireError> {
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge(text.len()));
    }
    let envelope: Inbound = serde_json::from_str(text)?;
    match envelope.ctx.as_str() {
        CTX_VENTCHANGE => Ok(ClientCommand::ChangeVentilation(serde_json::from_value(envelope.data)?)),
        CTX_LOCKCHANGE => {
            let locks: LockPayload = serde_json::from_value(envelope.data)?;
            let changes: Vec<_> = [(LockKind::Laser, locks.laser), (LockKind::Olga, locks.olga)]
                .into_iter()
                .filter_map(|(kind, active)| active.map(|a| (kind, a)))
                .collect();
            if changes.is_empty() {
                return Err(WireError::EmptyLockChange);
            }
            Ok(ClientCommand::ChangeLocks(changes))
        }
        other => Err(WireError::UnknownContext(other.to_string())),
    }
}
