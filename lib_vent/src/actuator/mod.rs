//! # Actuator Module
//!
//! Everything between the canonical state and the damper microcontroller.
//!
//! ## Core Components:
//!
//! - **`codec`**: the byte-level damper command frame and the classification of the
//!   lines the controller prints back.
//! - **`driver`**: the actor that turns every canonical state into a frame, spaces
//!   damper movements apart and writes them to the link.
//! - **`serial`**: opens the real serial device (feature `serial`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Damper command frames and inbound line classification.
pub mod codec;
/// The actuation driver actor.
pub mod driver;
/// Serial port transport.
#[cfg(feature = "serial")]
pub mod serial;

pub use codec::{decode_line, encode_damper_cmd, CodecError, DamperFrame, Direction, InboundLine, MsgType};
pub use driver::{ActuatorDriver, DriverError};
