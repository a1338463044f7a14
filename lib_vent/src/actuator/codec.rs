//! # Damper Controller Codec
//!
//! Outbound frames have the layout
//!
//! ```text
//! [ '>' | target id | length | msg type | reach | d1 | d2 | d3 | fan ]
//! ```
//!
//! where `length` counts the bytes after itself. The controller echoes traffic back
//! as text lines: `<` followed by the hex of sender id, length and message for
//! packets it received on its bus, `>` and the same hex layout for packets it sent,
//! and free-form diagnostics otherwise.

use thiserror::Error;

use crate::core::model::{DamperPosition, FanState, VentilationState};

/// Marks the start of a frame on the serial link.
pub const START_BYTE: u8 = b'>';
/// Receive buffer size of the controller; a frame's body may not exceed it.
pub const MAX_BODY_LEN: usize = 16;
/// Prefix of a packet the controller received.
pub const RECEIVED_PREFIX: u8 = b'<';

const REACH_LOCAL: u8 = 0;
const FAN_BIT: u8 = 0b0000_0001;

/// Errors raised while building a frame.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The body would overflow the controller's receive buffer.
    #[error("frame body of {len} bytes exceeds the controller buffer of {max}")]
    FrameTooLong {
        /// Body length that was requested.
        len: usize,
        /// Controller limit.
        max: usize,
    },
}

/// Message types understood by the controller firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// Set damper positions and fan.
    DamperCmd,
    /// Pressure sensor reading.
    PressureInfo,
    /// A damper or sensor failure report.
    Error,
    /// Controller settings update.
    UpdateSettings,
    /// Ask nodes to pick a bus id on their own.
    PjonIdDoAuto,
    /// Ask nodes for their bus id.
    PjonIdQuestion,
    /// A node announcing its bus id.
    PjonIdInfo,
    /// Assign a bus id.
    PjonIdSet,
    /// Anything the firmware table does not name.
    Unknown(u8),
}

impl From<u8> for MsgType {
    fn from(b: u8) -> Self {
        match b {
            0 => Self::DamperCmd,
            1 => Self::PressureInfo,
            2 => Self::Error,
            3 => Self::UpdateSettings,
            4 => Self::PjonIdDoAuto,
            5 => Self::PjonIdQuestion,
            6 => Self::PjonIdInfo,
            7 => Self::PjonIdSet,
            other => Self::Unknown(other),
        }
    }
}

impl From<MsgType> for u8 {
    fn from(t: MsgType) -> u8 {
        match t {
            MsgType::DamperCmd => 0,
            MsgType::PressureInfo => 1,
            MsgType::Error => 2,
            MsgType::UpdateSettings => 3,
            MsgType::PjonIdDoAuto => 4,
            MsgType::PjonIdQuestion => 5,
            MsgType::PjonIdInfo => 6,
            MsgType::PjonIdSet => 7,
            MsgType::Unknown(b) => b,
        }
    }
}

/// An encoded frame, ready to be written to the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DamperFrame(Vec<u8>);

impl DamperFrame {
    /// Builds a frame around `body`, whose first byte is the message type.
    pub fn new(target_id: u8, body: &[u8]) -> Result<Self, CodecError> {
        if body.len() > MAX_BODY_LEN {
            return Err(CodecError::FrameTooLong { len: body.len(), max: MAX_BODY_LEN });
        }
        let mut bytes = Vec::with_capacity(3 + body.len());
        bytes.push(START_BYTE);
        bytes.push(target_id);
        // Bounded by MAX_BODY_LEN above.
        bytes.push(body.len() as u8);
        bytes.extend_from_slice(body);
        Ok(Self(bytes))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for DamperFrame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

fn damper_code(pos: DamperPosition) -> u8 {
    match pos {
        DamperPosition::Closed => 0,
        DamperPosition::Open => 1,
        DamperPosition::HalfOpen => 2,
    }
}

fn fan_code(fan: FanState) -> u8 {
    match fan {
        FanState::On => FAN_BIT,
        FanState::Off => 0,
    }
}

/// # Encode Damper Command
///
/// Pure function of the state and target id. Lock flags are not transmitted.
pub fn encode_damper_cmd(state: &VentilationState, target_id: u8) -> Result<DamperFrame, CodecError> {
    let body = [
        u8::from(MsgType::DamperCmd),
        REACH_LOCAL,
        damper_code(state.dampers[0]),
        damper_code(state.dampers[1]),
        damper_code(state.dampers[2]),
        fan_code(state.fan),
    ];
    DamperFrame::new(target_id, &body)
}

/// Whether a hex dump line describes a packet going in or out of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// `<` lines: the controller received this packet.
    Received,
    /// `>` lines: the controller sent this packet.
    Sent,
}

/// A classified line read back from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundLine {
    /// A hex dump of a bus packet.
    Packet {
        /// Received or sent by the controller.
        direction: Direction,
        /// Bus id of the peer.
        peer: u8,
        /// Message type, the first byte of the message.
        msg_type: MsgType,
        /// Message bytes after the type.
        payload: Vec<u8>,
    },
    /// Anything else the firmware printed.
    Text(String),
}

/// # Decode Line
///
/// Classifies one line (without its terminator). Malformed hex dumps fall back to
/// [`InboundLine::Text`] so nothing the controller says is lost.
pub fn decode_line(line: &[u8]) -> InboundLine {
    let text = String::from_utf8_lossy(line).trim_end_matches(['\r', '\n']).to_string();
    let direction = match text.as_bytes().first() {
        Some(&RECEIVED_PREFIX) => Direction::Received,
        Some(&START_BYTE) => Direction::Sent,
        _ => return InboundLine::Text(text),
    };
    let Ok(bytes) = hex::decode(&text[1..]) else {
        return InboundLine::Text(text);
    };
    match bytes.as_slice() {
        [peer, len, msg @ ..] if !msg.is_empty() && msg.len() == usize::from(*len) => InboundLine::Packet {
            direction,
            peer: *peer,
            msg_type: MsgType::from(msg[0]),
            payload: msg[1..].to_vec(),
        },
        _ => InboundLine::Text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DamperPosition::*;

    #[test]
    fn damper_command_layout() {
        let state = VentilationState::new([Open, HalfOpen, Closed], FanState::On);
        let frame = encode_damper_cmd(&state, 1).unwrap();
        assert_eq!(frame.as_bytes(), &[b'>', 1, 6, 0, 0, 1, 2, 0, 1]);
    }

    #[test]
    fn lock_flags_do_not_reach_the_wire() {
        let plain = VentilationState::shut();
        let mut locked = plain;
        locked.laser_lock = true;
        locked.olga_lock = true;
        assert_eq!(encode_damper_cmd(&plain, 3), encode_damper_cmd(&locked, 3));
        assert_eq!(encode_damper_cmd(&plain, 3).unwrap().as_bytes()[1], 3);
    }

    #[test]
    fn oversized_body_is_refused() {
        assert_eq!(
            DamperFrame::new(1, &[0; 17]),
            Err(CodecError::FrameTooLong { len: 17, max: MAX_BODY_LEN })
        );
        assert!(DamperFrame::new(1, &[0; 16]).is_ok());
    }

    #[test]
    fn received_packet_dump_is_classified() {
        // sender 2, length 3, MSG_ERROR with two payload bytes
        let line = decode_line(b"<0203020a0b\r\n");
        assert_eq!(
            line,
            InboundLine::Packet {
                direction: Direction::Received,
                peer: 2,
                msg_type: MsgType::Error,
                payload: vec![0x0a, 0x0b],
            }
        );
    }

    #[test]
    fn echoed_command_is_classified_as_sent() {
        let line = decode_line(b">0106000001020001");
        assert!(matches!(line, InboundLine::Packet { direction: Direction::Sent, msg_type: MsgType::DamperCmd, .. }));
    }

    #[test]
    fn diagnostics_and_malformed_dumps_stay_text() {
        assert_eq!(decode_line(b"Unknown MSG type 9\r"), InboundLine::Text("Unknown MSG type 9".into()));
        assert!(matches!(decode_line(b"<zz"), InboundLine::Text(_)));
        // declared length does not match
        assert!(matches!(decode_line(b"<020501"), InboundLine::Text(_)));
        assert_eq!(MsgType::from(42), MsgType::Unknown(42));
    }
}
