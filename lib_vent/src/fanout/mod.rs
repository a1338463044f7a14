//! # Client Fanout Module
//!
//! Keeps every websocket client in step with the canonical state.
//!
//! ## Core Components:
//!
//! - **`wire`**: the `{"ctx","data"}` JSON envelope in both directions.
//! - **`snapshot`**: the actor that encodes each canonical state once, broadcasts it
//!   and replays the latest one to newly connected clients.
//! - **`session`**: per-client read and write halves, independent of the websocket
//!   library in use.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Per-client reader and writer.
pub mod session;
/// Last-known-state broadcaster.
pub mod snapshot;
/// JSON message envelope.
pub mod wire;

pub use session::{ClientConnection, ClientSession, ClientSink, SessionError};
pub use snapshot::StateFanout;
pub use wire::{ClientCommand, WireError};
