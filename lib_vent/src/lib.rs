//! # lib_vent
//!
//! The arbitration and actuation engine behind the ventilation rig (three motorized
//! dampers and a fan). Every component is an independent actor that talks to the
//! others exclusively through the typed [`core::bus::EventBus`].
//!
//! ## Modules:
//! - **`core`**: the event bus, the ventilation data model and the arbitration engine
//!   that owns the canonical state and the Laser/OLGA interlocks.
//! - **`actuator`**: the damper microcontroller frame codec and the rate-limited
//!   serial driver.
//! - **`fanout`**: last-known-state replay and broadcast to websocket clients, plus the
//!   per-client writer session.
//! - **`bridge`**: the MQTT side: laser-cutter and presence feeds in, ventilation
//!   state out, presence-based auto-off.
//! - **`configs`**: the immutable settings record handed to each actor.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod actuator;
pub mod bridge;
pub mod configs;
pub mod core;
pub mod fanout;

// Re-export the types nearly every caller touches.
pub use crate::configs::settings::Settings;
pub use crate::core::bus::EventBus;
pub use crate::core::model::{
    ChangeRequest, DamperPosition, FanState, LockChange, LockKind, LockState, Origin, Reply,
    VentilationState,
};
