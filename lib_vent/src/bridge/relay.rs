//! # Feed Relay
//!
//! Turns decoded feed events into bus requests. Everything coming from the building
//! feeds is trusted (`Local`) and has no reply sink.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::bridge::events::{BridgeInput, LaserCutterEvent, PresenceUpdate};
use crate::bridge::presence::PresenceTracker;
use crate::core::bus::EventBus;
use crate::core::model::{ChangeRequest, LockChange, LockKind, VentilationState};

/// # Feed Relay
///
/// Owned by the bridge loop; holds the presence tracker.
pub struct FeedRelay {
    bus: Arc<EventBus>,
    presence: PresenceTracker,
}

impl FeedRelay {
    /// Creates a relay whose auto-off fires `auto_off` after the space empties.
    pub fn new(bus: Arc<EventBus>, auto_off: Duration) -> Self {
        Self { bus, presence: PresenceTracker::new(auto_off) }
    }

    /// Handles one feed event.
    pub async fn handle(&mut self, input: BridgeInput, now: Instant) {
        match input {
            BridgeInput::LaserCutter(LaserCutterEvent { is_hot }) => {
                log::info!("bridge: laser cutter {}", if is_hot { "in use" } else { "idle" });
                self.bus.lock_changes.publish(LockChange::local(LockKind::Laser, is_hot)).await;
            }
            BridgeInput::Presence(PresenceUpdate { present }) => {
                log::debug!("bridge: presence {}", present);
                self.presence.update(present, now);
            }
        }
    }

    /// The pending auto-off deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.presence.deadline()
    }

    /// Called when the deadline passes; shuts everything if the space is still empty.
    pub async fn on_deadline(&mut self, now: Instant) {
        if self.presence.fire(now) {
            log::info!("bridge: space empty, switching ventilation off");
            self.bus.change_requests.publish(ChangeRequest::local(VentilationState::shut())).await;
        }
    }
}
