//! # Presence Auto-Off
//!
//! Shuts the ventilation down a while after the space has become empty.

use std::time::Duration;

use tokio::time::Instant;

/// Tracks presence and the pending auto-off deadline.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    auto_off: Duration,
    present: Option<bool>,
    deadline: Option<Instant>,
}

impl PresenceTracker {
    /// A tracker with no presence information yet.
    pub fn new(auto_off: Duration) -> Self {
        Self { auto_off, present: None, deadline: None }
    }

    /// # Update
    ///
    /// Records a presence report. A transition to absent (re)starts the deadline at
    /// `now + auto_off`; repeated absent reports leave it alone; presence clears it.
    pub fn update(&mut self, present: bool, now: Instant) {
        match (self.present, present) {
            (_, true) => self.deadline = None,
            (Some(false), false) => {}
            (_, false) => self.deadline = Some(now + self.auto_off),
        }
        self.present = Some(present);
    }

    /// The pending auto-off deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Consumes the deadline if it has passed while the space is still empty.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(d) if d <= now && self.present == Some(false) => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
