//! # Arbitration Engine
//!
//! The single writer of the canonical [`VentilationState`] and of the two interlocks.
//!
//! ## Core Responsibilities:
//!
//! - **Transition validation**: every proposed state is compared against the current
//!   canonical state, per actuator, and refused when it would be unsafe
//!   (`Prohibited`) or needs a trusted origin (`NotAuthorized`).
//! - **Safety override**: an accepted state with every damper closed always has the
//!   fan off, corrected silently instead of rejected.
//! - **Lock bookkeeping**: Laser and OLGA locks each carry an independent expiry
//!   deadline, restarted (never stacked) by every activation.
//! - **Publishing**: accepted states go to `state_changed` with the lock flags
//!   embedded. Lock changes and expiries republish the current state so observers
//!   see the new flags; before the first accepted state there is nothing to carry
//!   them and the flags wait for it.
//!
//! [`ArbitrationEngine`] is the synchronous state machine; [`Arbiter`] is the actor
//! that feeds it from the bus one event at a time, so no locking is needed.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};

use crate::configs::settings::Settings;
use crate::core::bus::EventBus;
use crate::core::error::ArbitrationError;
use crate::core::model::{
    ChangeRequest, DamperPosition, FanState, LockChange, LockKind, LockState, Origin, Reply,
    ReplySender, VentilationState,
};

/// # Check Transition
///
/// Validates `next` against `prev` under the current interlocks.
///
/// The OLGA "can't stop the fan" rule is unconditional: a `Remote` request may not
/// turn the fan off while the OLGA lock is held, whatever the damper positions were.
/// Closing the last open damper while the fan runs is treated as stopping the fan.
pub fn check_transition(
    prev: &VentilationState,
    next: &VentilationState,
    origin: Origin,
    locks: LockState,
) -> Result<(), ArbitrationError> {
    let changed = |i: usize| prev.dampers[i] != next.dampers[i];
    let closing = |i: usize| changed(i) && next.dampers[i] == DamperPosition::Closed;
    let fully_opening = |i: usize| changed(i) && next.dampers[i] == DamperPosition::Open;

    let opening_damper1 = changed(0) && next.dampers[0] != DamperPosition::Closed;
    // An all-closed result stops the fan through the override, so it counts as a stop.
    let stopping_fan = prev.fan.is_on() && (!next.fan.is_on() || next.all_closed());
    let starting_fan = prev.fan != next.fan && next.fan == FanState::On;

    if starting_fan && next.all_closed() {
        return Err(ArbitrationError::Prohibited("Won't start Fan with dampers closed!"));
    }
    if next.fan.is_on() && next.all_open() && !origin.is_local() {
        return Err(ArbitrationError::NotAuthorized("Please open only 2 dampers at a time"));
    }
    if locks.laser {
        if closing(0) {
            return Err(ArbitrationError::Prohibited(
                "Can't close LaserDamper while Lasercutter in use!",
            ));
        }
        if fully_opening(1) || fully_opening(2) {
            return Err(ArbitrationError::Prohibited(
                "Can't fully open OLGA dampers while Lasercutter in use!",
            ));
        }
        if stopping_fan {
            return Err(ArbitrationError::Prohibited("Can't stop fan while Lasercutter in use!"));
        }
    }
    if locks.olga && !origin.is_local() {
        if stopping_fan {
            return Err(ArbitrationError::NotAuthorized("Can't stop fan while OLGA locked it"));
        }
        if closing(1) || closing(2) || opening_damper1 {
            return Err(ArbitrationError::NotAuthorized(
                "Can't close OLGA dampers or open LaserDamper while OLGA needs ventilation",
            ));
        }
    }
    Ok(())
}

/// # Arbitration Engine
///
/// Canonical state, lock flags and lock deadlines. Time is passed in explicitly so
/// the state machine stays synchronous.
#[derive(Debug, Clone)]
pub struct ArbitrationEngine {
    lock_timeout: Duration,
    state: Option<VentilationState>,
    locks: LockState,
    laser_deadline: Option<Instant>,
    olga_deadline: Option<Instant>,
}

impl ArbitrationEngine {
    /// An engine with no known state and both locks released.
    pub fn new(lock_timeout: Duration) -> Self {
        Self { lock_timeout, state: None, locks: LockState::default(), laser_deadline: None, olga_deadline: None }
    }

    /// The canonical state with the current lock flags embedded, once one is known.
    pub fn state(&self) -> Option<VentilationState> {
        self.state.map(|s| s.with_locks(self.locks))
    }

    /// Current lock flags.
    pub fn locks(&self) -> LockState {
        self.locks
    }

    /// # Handle Request
    ///
    /// Validates and applies a proposed state, returning the new canonical state.
    /// The first request after startup is accepted without validation since there is
    /// nothing to compare it with.
    pub fn handle_request(
        &mut self,
        requested: VentilationState,
        origin: Origin,
    ) -> Result<VentilationState, ArbitrationError> {
        if let Some(prev) = &self.state {
            check_transition(prev, &requested, origin, self.locks)?;
        }
        let mut next = requested;
        if next.all_closed() {
            next.fan = FanState::Off;
        }
        next = next.with_locks(self.locks);
        self.state = Some(next);
        Ok(next)
    }

    /// # Handle Lock Change
    ///
    /// Only `Local` origins may touch a lock. Activation restarts that lock's deadline
    /// at `now + lock_timeout`; release clears it.
    pub fn handle_lock_change(
        &mut self,
        kind: LockKind,
        active: bool,
        origin: Origin,
        now: Instant,
    ) -> Result<LockState, ArbitrationError> {
        if !origin.is_local() {
            return Err(match kind {
                LockKind::Laser => ArbitrationError::Prohibited("Lock can only be changed with LaserCard"),
                LockKind::Olga => ArbitrationError::NotAuthorized("Not authorized to change OLGA lock"),
            });
        }
        self.locks.set(kind, active);
        let deadline = active.then(|| now + self.lock_timeout);
        *self.deadline_mut(kind) = deadline;
        Ok(self.locks)
    }

    /// Releases every lock whose deadline is at or before `now` and returns which.
    pub fn expire_locks(&mut self, now: Instant) -> Vec<LockKind> {
        let mut expired = Vec::new();
        for kind in LockKind::ALL {
            let deadline = self.deadline_mut(kind);
            if deadline.is_some_and(|d| d <= now) {
                *deadline = None;
                self.locks.set(kind, false);
                expired.push(kind);
            }
        }
        expired
    }

    /// The earliest pending lock deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.laser_deadline, self.olga_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn deadline_mut(&mut self, kind: LockKind) -> &mut Option<Instant> {
        match kind {
            LockKind::Laser => &mut self.laser_deadline,
            LockKind::Olga => &mut self.olga_deadline,
        }
    }
}

/// # Arbiter
///
/// The actor wrapping [`ArbitrationEngine`]: reads change requests, lock changes and
/// lock deadlines from one multiplexed wait and publishes the outcomes.
pub struct Arbiter {
    bus: Arc<EventBus>,
    engine: ArbitrationEngine,
}

impl Arbiter {
    /// Creates the actor. Nothing runs until [`Arbiter::run`] is awaited.
    pub fn new(bus: Arc<EventBus>, settings: &Settings) -> Self {
        Self { bus, engine: ArbitrationEngine::new(settings.lock_timeout) }
    }

    /// Main loop. Returns after the bus shutdown signal.
    pub async fn run(mut self) {
        let mut requests = self.bus.change_requests.subscribe();
        let mut lock_changes = self.bus.lock_changes.subscribe();
        let mut shutdown = self.bus.on_shutdown();
        log::info!("arbiter: started (lock timeout {:?})", self.engine.lock_timeout);

        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("arbiter: shutdown");
                    break;
                }
                Some(request) = requests.recv() => self.on_request(request).await,
                Some(change) = lock_changes.recv() => self.on_lock_change(change).await,
                _ = sleep_until_deadline(deadline) => self.on_deadline().await,
            }
        }

        self.bus.change_requests.unsubscribe(requests);
        self.bus.lock_changes.unsubscribe(lock_changes);
    }

    async fn on_request(&mut self, request: ChangeRequest) {
        log::debug!("arbiter: request {} from {:?}", request.state, request.origin);
        match self.engine.handle_request(request.state, request.origin) {
            Ok(state) => {
                log::info!("arbiter: accepted {}", state);
                self.bus.state_changed.publish(state).await;
            }
            Err(err) => {
                log::warn!("arbiter: rejected {} from {:?}: {}", request.state, request.origin, err);
                self.reply(request.reply.as_ref(), err);
            }
        }
    }

    async fn on_lock_change(&mut self, change: LockChange) {
        match self.engine.handle_lock_change(change.kind, change.active, change.origin, Instant::now()) {
            Ok(_) => {
                log::info!("arbiter: {} lock {}", change.kind, if change.active { "set" } else { "released" });
                self.publish_locks().await;
            }
            Err(err) => {
                log::warn!("arbiter: {} lock change from {:?} refused: {}", change.kind, change.origin, err);
                self.reply(change.reply.as_ref(), err);
            }
        }
    }

    async fn on_deadline(&mut self) {
        let expired = self.engine.expire_locks(Instant::now());
        if expired.is_empty() {
            return;
        }
        for kind in &expired {
            log::info!("arbiter: {} lock expired", kind);
        }
        self.publish_locks().await;
    }

    async fn publish_locks(&self) {
        match self.engine.state() {
            Some(state) => {
                self.bus.state_changed.publish(state).await;
            }
            None => log::debug!("arbiter: no state yet, {:?} rides on the first one", self.engine.locks()),
        }
    }

    /// Best effort: a full or closed reply queue drops the answer.
    fn reply(&self, sink: Option<&ReplySender>, err: ArbitrationError) {
        let Some(tx) = sink else { return };
        if let Some(state) = self.engine.state() {
            let _ = tx.try_send(Reply::State(state));
        }
        if tx.try_send(Reply::Error(err)).is_err() {
            log::debug!("arbiter: reply queue full or closed, dropping rejection");
        }
    }
}

/// Sleeps until `deadline`, or forever when there is none.
pub(crate) async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DamperPosition::*;

    fn vs(d: [DamperPosition; 3], fan: FanState) -> VentilationState {
        VentilationState::new(d, fan)
    }

    fn engine_at(state: VentilationState) -> ArbitrationEngine {
        let mut engine = ArbitrationEngine::new(Duration::from_secs(60));
        engine.handle_request(state, Origin::Local).unwrap();
        engine
    }

    #[test]
    fn first_request_is_accepted_unconditionally() {
        let mut engine = ArbitrationEngine::new(Duration::from_secs(60));
        let shut = vs([Closed, Closed, Closed], FanState::Off);
        assert_eq!(engine.handle_request(shut, Origin::Remote), Ok(shut));
        assert_eq!(engine.state(), Some(shut));
    }

    #[test]
    fn first_request_still_gets_the_fan_override() {
        let mut engine = ArbitrationEngine::new(Duration::from_secs(60));
        let accepted = engine.handle_request(vs([Closed, Closed, Closed], FanState::On), Origin::Remote).unwrap();
        assert_eq!(accepted.fan, FanState::Off);
    }

    #[test]
    fn starting_fan_with_dampers_closed_is_prohibited() {
        let mut engine = engine_at(vs([Closed, Closed, Closed], FanState::Off));
        let err = engine.handle_request(vs([Closed, Closed, Closed], FanState::On), Origin::Local).unwrap_err();
        assert!(matches!(err, ArbitrationError::Prohibited(_)));
        assert_eq!(engine.state(), Some(vs([Closed, Closed, Closed], FanState::Off)));
    }

    #[test]
    fn closing_every_damper_turns_the_fan_off() {
        let mut engine = engine_at(vs([Open, Closed, Closed], FanState::On));
        let accepted = engine.handle_request(vs([Closed, Closed, Closed], FanState::On), Origin::Remote).unwrap();
        assert_eq!(accepted, vs([Closed, Closed, Closed], FanState::Off));
    }

    #[test]
    fn three_open_dampers_need_a_local_origin() {
        let mut engine = engine_at(vs([Open, Open, Closed], FanState::On));
        let all_open = vs([Open, HalfOpen, Open], FanState::On);
        let err = engine.handle_request(all_open, Origin::Remote).unwrap_err();
        assert!(matches!(err, ArbitrationError::NotAuthorized(_)));
        assert_eq!(engine.handle_request(all_open, Origin::Local), Ok(all_open));
    }

    #[test]
    fn laser_lock_guards_damper1_and_the_fan() {
        let mut engine = engine_at(vs([Open, Closed, Closed], FanState::On));
        engine.handle_lock_change(LockKind::Laser, true, Origin::Local, Instant::now()).unwrap();

        for (next, why) in [
            (vs([Closed, Closed, Closed], FanState::On), "closing damper 1"),
            (vs([Open, Open, Closed], FanState::On), "opening damper 2"),
            (vs([Open, Closed, Open], FanState::On), "opening damper 3"),
            (vs([Open, Closed, Closed], FanState::Off), "stopping the fan"),
        ] {
            let err = engine.handle_request(next, Origin::Local).unwrap_err();
            assert!(matches!(err, ArbitrationError::Prohibited(_)), "{why}");
        }
        // Half-opening a non-laser damper is still allowed.
        assert!(engine.handle_request(vs([Open, HalfOpen, Closed], FanState::On), Origin::Remote).is_ok());
    }

    #[test]
    fn olga_lock_only_binds_remote_requests() {
        let mut engine = engine_at(vs([Closed, Open, Closed], FanState::On));
        engine.handle_lock_change(LockKind::Olga, true, Origin::Local, Instant::now()).unwrap();

        for next in [
            vs([Closed, Open, Closed], FanState::Off),
            vs([Closed, Closed, Closed], FanState::Off),
            vs([HalfOpen, Open, Closed], FanState::On),
        ] {
            let err = engine.handle_request(next, Origin::Remote).unwrap_err();
            assert!(matches!(err, ArbitrationError::NotAuthorized(_)));
        }
        assert!(engine.handle_request(vs([Closed, Open, Closed], FanState::Off), Origin::Local).is_ok());
    }

    #[test]
    fn remote_clients_cannot_touch_locks() {
        let mut engine = ArbitrationEngine::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(matches!(
            engine.handle_lock_change(LockKind::Laser, true, Origin::Remote, now),
            Err(ArbitrationError::Prohibited(_))
        ));
        assert!(matches!(
            engine.handle_lock_change(LockKind::Olga, true, Origin::Remote, now),
            Err(ArbitrationError::NotAuthorized(_))
        ));
        assert_eq!(engine.locks(), LockState::default());
    }

    #[test]
    fn reactivation_restarts_the_deadline() {
        let mut engine = ArbitrationEngine::new(Duration::from_secs(60));
        let t0 = Instant::now();
        engine.handle_lock_change(LockKind::Laser, true, Origin::Local, t0).unwrap();
        let t1 = t0 + Duration::from_secs(50);
        engine.handle_lock_change(LockKind::Laser, true, Origin::Local, t1).unwrap();
        assert_eq!(engine.next_deadline(), Some(t1 + Duration::from_secs(60)));

        assert!(engine.expire_locks(t0 + Duration::from_secs(61)).is_empty());
        assert_eq!(engine.expire_locks(t1 + Duration::from_secs(60)), vec![LockKind::Laser]);
        assert!(!engine.locks().laser);
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn lock_deadlines_are_independent() {
        let mut engine = ArbitrationEngine::new(Duration::from_secs(10));
        let t0 = Instant::now();
        engine.handle_lock_change(LockKind::Laser, true, Origin::Local, t0).unwrap();
        engine.handle_lock_change(LockKind::Olga, true, Origin::Local, t0 + Duration::from_secs(5)).unwrap();
        assert_eq!(engine.expire_locks(t0 + Duration::from_secs(10)), vec![LockKind::Laser]);
        assert!(engine.locks().olga);
        engine.handle_lock_change(LockKind::Olga, false, Origin::Local, t0 + Duration::from_secs(11)).unwrap();
        assert_eq!(engine.next_deadline(), None);
    }

    #[test]
    fn same_state_twice_is_a_no_op_transition() {
        let state = vs([Open, HalfOpen, Closed], FanState::On);
        let mut engine = engine_at(state);
        assert_eq!(engine.handle_request(state, Origin::Remote), Ok(state));
        assert_eq!(engine.state(), Some(state));
    }

    /// Walks every reachable transition from every state, under every lock combination
    /// and origin, and checks the safety invariants on whatever gets accepted.
    #[test]
    fn invariants_hold_over_all_transitions() {
        let positions = [Closed, HalfOpen, Open];
        let mut states = Vec::new();
        for a in positions {
            for b in positions {
                for c in positions {
                    for fan in [FanState::Off, FanState::On] {
                        states.push(vs([a, b, c], fan));
                    }
                }
            }
        }

        for prev in &states {
            for locks in [(false, false), (true, false), (false, true), (true, true)] {
                for origin in [Origin::Local, Origin::Remote] {
                    for next in &states {
                        let mut engine = engine_at(*prev);
                        let now = Instant::now();
                        engine.handle_lock_change(LockKind::Laser, locks.0, Origin::Local, now).unwrap();
                        engine.handle_lock_change(LockKind::Olga, locks.1, Origin::Local, now).unwrap();
                        let Some(before) = engine.state() else { continue };

                        let Ok(after) = engine.handle_request(*next, origin) else {
                            assert_eq!(engine.state(), Some(before), "rejection must not mutate");
                            continue;
                        };

                        assert!(!(after.all_closed() && after.fan.is_on()));
                        if origin == Origin::Remote {
                            assert!(!(after.all_open() && after.fan.is_on()));
                        }
                        if locks.0 {
                            let b = before.dampers;
                            let a = after.dampers;
                            assert!(!(b[0] != Closed && a[0] == Closed));
                            assert!(!(b[1] != Open && a[1] == Open));
                            assert!(!(b[2] != Open && a[2] == Open));
                            assert!(!(before.fan.is_on() && !after.fan.is_on()));
                        }
                        if locks.1 && origin == Origin::Remote {
                            let b = before.dampers;
                            let a = after.dampers;
                            assert!(!(before.fan.is_on() && !after.fan.is_on()));
                            assert!(!(b[1] != Closed && a[1] == Closed));
                            assert!(!(b[2] != Closed && a[2] == Closed));
                            assert!(!(b[0] != a[0] && a[0] != Closed));
                        }
                    }
                }
            }
        }
    }
}
