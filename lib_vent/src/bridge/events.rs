//! # Bridge Events
//!
//! Payloads exchanged with the building's MQTT broker.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::configs::settings::{MqttTopics, SettingsError};
use crate::core::model::VentilationState;

/// Errors raised by the external bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A feed payload could not be decoded.
    #[error("invalid payload on '{topic}': {source}")]
    InvalidPayload {
        /// Topic the payload arrived on.
        topic: String,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// The broker address in the settings is unusable.
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

/// Laser cutter in-use feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaserCutterEvent {
    /// `true` while the cutter is in use.
    #[serde(rename = "IsHot")]
    pub is_hot: bool,
}

/// Space presence feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// `false` once everybody has left.
    #[serde(rename = "Present")]
    pub present: bool,
}

/// A canonical state stamped with the publish time, as republished on the broker.
#[derive(Debug, Clone, Serialize)]
pub struct VentilationRecord {
    /// The state, flattened into the record.
    #[serde(flatten)]
    pub state: VentilationState,
    /// Unix seconds.
    #[serde(rename = "Ts")]
    pub ts: i64,
}

impl VentilationRecord {
    /// Stamps `state` with the current time.
    pub fn now(state: VentilationState) -> Self {
        Self { state, ts: Utc::now().timestamp() }
    }
}

/// A decoded feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeInput {
    /// Laser cutter in use, or not.
    LaserCutter(LaserCutterEvent),
    /// Somebody is in the space, or not.
    Presence(PresenceUpdate),
}

/// # Decode Input
///
/// Maps a message from one of the subscribed topics to a [`BridgeInput`]. Messages
/// on other topics yield `Ok(None)`.
pub fn decode_input(topics: &MqttTopics, topic: &str, payload: &[u8]) -> Result<Option<BridgeInput>, BridgeError> {
    let invalid = |source| BridgeError::InvalidPayload { topic: topic.to_string(), source };
    if topic == topics.laser_cutter {
        let event = serde_json::from_slice(payload).map_err(invalid)?;
        Ok(Some(BridgeInput::LaserCutter(event)))
    } else if topic == topics.presence {
        let event = serde_json::from_slice(payload).map_err(invalid)?;
        Ok(Some(BridgeInput::Presence(event)))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{DamperPosition::*, FanState};

    #[test]
    fn feeds_are_routed_by_topic() {
        let topics = MqttTopics::default();
        assert_eq!(
            decode_input(&topics, &topics.laser_cutter, br#"{"IsHot":true,"Who":"x"}"#).unwrap(),
            Some(BridgeInput::LaserCutter(LaserCutterEvent { is_hot: true }))
        );
        assert_eq!(
            decode_input(&topics, &topics.presence, br#"{"Present":false}"#).unwrap(),
            Some(BridgeInput::Presence(PresenceUpdate { present: false }))
        );
        assert!(decode_input(&topics, "realraum/other", b"garbage").unwrap().is_none());
        assert!(matches!(
            decode_input(&topics, &topics.presence, b"{}"),
            Err(BridgeError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn record_flattens_state_and_adds_timestamp() {
        let record = VentilationRecord { state: VentilationState::new([Open, Closed, Closed], FanState::On), ts: 1_700_000_000 };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["Damper1"], "open");
        assert_eq!(json["Fan"], "on");
        assert_eq!(json["Ts"], 1_700_000_000);
    }
}
