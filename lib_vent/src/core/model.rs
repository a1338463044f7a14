//! # Ventilation Data Model
//!
//! The records that flow over the bus. `VentilationState` is the one authoritative
//! description of the rig; the request envelopes wrap a proposed change together with
//! its trust classification and an optional private reply sink.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::core::error::ArbitrationError;

/// Number of motorized dampers on the rig.
pub const DAMPER_COUNT: usize = 3;

/// Capacity of a client's private reply queue.
pub const REPLY_QUEUE_CAPACITY: usize = 10;

/// Position of a single damper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DamperPosition {
    /// Fully shut.
    #[serde(rename = "closed")]
    Closed,
    /// Partially open.
    #[serde(rename = "halfopen")]
    HalfOpen,
    /// Fully open.
    #[serde(rename = "open")]
    Open,
}

impl DamperPosition {
    /// `true` for `Closed`.
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "halfopen",
            Self::Open => "open",
        }
    }
}

/// Fan power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FanState {
    /// Stopped.
    #[default]
    #[serde(rename = "off")]
    Off,
    /// Running.
    #[serde(rename = "on")]
    On,
}

impl FanState {
    /// `true` for `On`.
    pub fn is_on(self) -> bool {
        self == Self::On
    }
}

/// Trust classification of whoever asked for a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Physical panel, laser card reader, presence automation.
    Local,
    /// A web client.
    Remote,
}

impl Origin {
    /// `true` for `Local`.
    pub fn is_local(self) -> bool {
        self == Self::Local
    }
}

/// The two named interlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    /// Asserted while the laser cutter is in use.
    Laser,
    /// Asserted while the OLGA process exhaust needs guaranteed ventilation.
    Olga,
}

impl LockKind {
    /// Both locks, in a fixed order.
    pub const ALL: [LockKind; 2] = [LockKind::Laser, LockKind::Olga];
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Laser => f.write_str("laser"),
            Self::Olga => f.write_str("olga"),
        }
    }
}

/// Current interlock flags. Mutated only by the arbitration engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LockState {
    /// Laser cutter in use.
    #[serde(rename = "LaserLock")]
    pub laser: bool,
    /// OLGA needs ventilation.
    #[serde(rename = "OLGALock")]
    pub olga: bool,
}

impl LockState {
    /// Writes the flag for `kind`.
    pub fn set(&mut self, kind: LockKind, active: bool) {
        match kind {
            LockKind::Laser => self.laser = active,
            LockKind::Olga => self.olga = active,
        }
    }
}

/// # Ventilation State
///
/// The canonical record of the rig. The lock flags are informational copies
/// embedded so observers see them atomically with the state they gate.
///
/// On the wire it is `{"Damper1":..,"Damper2":..,"Damper3":..,"Fan":..,"LaserLock":..,"OLGALock":..}`;
/// the lock fields are optional when decoding client requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "WireVentilationState", into = "WireVentilationState")]
pub struct VentilationState {
    /// Damper positions, index 0 is the laser cutter damper.
    pub dampers: [DamperPosition; DAMPER_COUNT],
    /// Fan power.
    pub fan: FanState,
    /// Copy of the Laser lock flag at publish time.
    pub laser_lock: bool,
    /// Copy of the OLGA lock flag at publish time.
    pub olga_lock: bool,
}

impl VentilationState {
    /// Builds a state with both lock flags cleared.
    pub fn new(dampers: [DamperPosition; DAMPER_COUNT], fan: FanState) -> Self {
        Self { dampers, fan, laser_lock: false, olga_lock: false }
    }

    /// Everything closed, fan off. The target of the presence auto-off.
    pub fn shut() -> Self {
        Self::new([DamperPosition::Closed; DAMPER_COUNT], FanState::Off)
    }

    /// `true` when no air path is open.
    pub fn all_closed(&self) -> bool {
        self.dampers.iter().all(|d| d.is_closed())
    }

    /// `true` when no damper is closed (half-open counts as open).
    pub fn all_open(&self) -> bool {
        self.dampers.iter().all(|d| !d.is_closed())
    }

    /// Returns a copy carrying the given lock flags.
    pub fn with_locks(mut self, locks: LockState) -> Self {
        self.laser_lock = locks.laser;
        self.olga_lock = locks.olga;
        self
    }

    /// `true` when both states put the dampers in the same positions.
    pub fn same_dampers(&self, other: &VentilationState) -> bool {
        self.dampers == other.dampers
    }
}

impl fmt::Display for VentilationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "D1={} D2={} D3={} fan={} laser={} olga={}",
            self.dampers[0].as_str(),
            self.dampers[1].as_str(),
            self.dampers[2].as_str(),
            if self.fan.is_on() { "on" } else { "off" },
            self.laser_lock,
            self.olga_lock,
        )
    }
}

#[derive(Serialize, Deserialize)]
struct WireVentilationState {
    #[serde(rename = "Damper1")]
    damper1: DamperPosition,
    #[serde(rename = "Damper2")]
    damper2: DamperPosition,
    #[serde(rename = "Damper3")]
    damper3: DamperPosition,
    #[serde(rename = "Fan")]
    fan: FanState,
    #[serde(rename = "LaserLock", default)]
    laser_lock: bool,
    #[serde(rename = "OLGALock", default)]
    olga_lock: bool,
}

impl From<WireVentilationState> for VentilationState {
    fn from(w: WireVentilationState) -> Self {
        Self {
            dampers: [w.damper1, w.damper2, w.damper3],
            fan: w.fan,
            laser_lock: w.laser_lock,
            olga_lock: w.olga_lock,
        }
    }
}

impl From<VentilationState> for WireVentilationState {
    fn from(s: VentilationState) -> Self {
        Self {
            damper1: s.dampers[0],
            damper2: s.dampers[1],
            damper3: s.dampers[2],
            fan: s.fan,
            laser_lock: s.laser_lock,
            olga_lock: s.olga_lock,
        }
    }
}

/// A direct answer from the arbitration engine to one requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The canonical state at the time of the rejection.
    State(VentilationState),
    /// The reason the request was refused.
    Error(ArbitrationError),
}

/// Sending half of a client's private reply queue.
pub type ReplySender = mpsc::Sender<Reply>;

/// # Change Request
///
/// A proposed new ventilation state. Created per inbound request, consumed once by
/// the arbitration engine, discarded after it produced a state update or a reply.
#[derive(Debug, Clone)]
pub struct ChangeRequest {
    /// The requested state. Lock flags in here are ignored.
    pub state: VentilationState,
    /// Who asked.
    pub origin: Origin,
    /// Where to send a rejection; `None` for bridge-originated requests.
    pub reply: Option<ReplySender>,
}

impl ChangeRequest {
    /// A trusted request without a reply sink.
    pub fn local(state: VentilationState) -> Self {
        Self { state, origin: Origin::Local, reply: None }
    }

    /// A request from a client that wants rejections sent back.
    pub fn from_client(state: VentilationState, origin: Origin, reply: ReplySender) -> Self {
        Self { state, origin, reply: Some(reply) }
    }
}

/// A request to set or clear one interlock.
#[derive(Debug, Clone)]
pub struct LockChange {
    /// Which lock.
    pub kind: LockKind,
    /// `true` activates (and restarts the expiry deadline), `false` releases.
    pub active: bool,
    /// Who asked. Only `Local` may change a lock.
    pub origin: Origin,
    /// Where to send a rejection.
    pub reply: Option<ReplySender>,
}

impl LockChange {
    /// A trusted lock change without a reply sink.
    pub fn local(kind: LockKind, active: bool) -> Self {
        Self { kind, active, origin: Origin::Local, reply: None }
    }
}
