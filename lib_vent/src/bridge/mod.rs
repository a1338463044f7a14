//! # External Bridge Module
//!
//! The link between the control plane and the building's MQTT broker.
//!
//! ## Core Components:
//!
//! - **`events`**: feed payloads in (`IsHot`, `Present`) and the timestamped state
//!   record out.
//! - **`presence`**: the auto-off deadline armed when the space empties.
//! - **`relay`**: turns feed events into trusted bus requests.
//! - **`mqtt`**: the broker connection loop (feature `mqtt`).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// Feed payloads and the republished state record.
pub mod events;
/// Broker connection loop.
#[cfg(feature = "mqtt")]
pub mod mqtt;
/// Presence tracking and auto-off deadline.
pub mod presence;
/// Feed events to bus requests.
pub mod relay;

pub use events::{BridgeError, BridgeInput, VentilationRecord};
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBridge;
pub use presence::PresenceTracker;
pub use relay::FeedRelay;
