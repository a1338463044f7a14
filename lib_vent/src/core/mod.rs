//! # Core Engine Module
//!
//! The authoritative half of the control plane. Everything that decides what the
//! ventilation rig is allowed to do lives here.
//!
//! ## Core Components:
//!
//! - **`bus`**: the in-process publish/subscribe broker. One strongly typed topic per
//!   event shape, bounded subscriber queues and a blocking `publish` that throttles
//!   the publisher when a subscriber falls behind.
//!
//! - **`model`**: `VentilationState`, the lock flags, and the request envelopes that
//!   travel over the bus.
//!
//! - **`arbiter`**: the single writer of canonical state. Validates every proposed
//!   transition against the safety and authorization interlocks and runs the lock
//!   expiry deadlines.
//!
//! - **`error`**: the `Prohibited` / `NotAuthorized` rejection taxonomy.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The arbitration engine and its actor loop.
pub mod arbiter;
/// The typed topic broker every actor communicates through.
pub mod bus;
/// Rejection reasons produced by the arbitration engine.
pub mod error;
/// Ventilation state, locks and request envelopes.
pub mod model;

// --- Public API Re-exports ---
pub use arbiter::{ArbitrationEngine, Arbiter};
pub use bus::{EventBus, Subscription, Topic};
pub use error::ArbitrationError;
