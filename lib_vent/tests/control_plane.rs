//! End-to-end behavior of the actors wired through one bus.

use std::sync::Arc;
use std::time::Duration;

use lib_vent::actuator::ActuatorDriver;
use lib_vent::core::{Arbiter, ArbitrationError, Topic};
use lib_vent::fanout::StateFanout;
use lib_vent::{
    ChangeRequest, DamperPosition::*, EventBus, FanState, LockChange, LockKind, Origin, Reply,
    Settings, VentilationState,
};
use tokio::io::{duplex, AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

async fn wait_for_subscribers<T>(topic: &Topic<T>, n: usize) {
    while topic.subscriber_count() < n {
        tokio::task::yield_now().await;
    }
}

async fn start_arbiter(bus: &Arc<EventBus>, settings: &Settings) {
    tokio::spawn(Arbiter::new(Arc::clone(bus), settings).run());
    wait_for_subscribers(&bus.lock_changes, 1).await;
    wait_for_subscribers(&bus.shutdown, 1).await;
}

async fn request(bus: &EventBus, state: VentilationState, origin: Origin) -> mpsc::Receiver<Reply> {
    let (tx, rx) = mpsc::channel(10);
    bus.change_requests.publish(ChangeRequest::from_client(state, origin, tx)).await;
    rx
}

#[tokio::test]
async fn first_state_is_accepted_then_fan_start_on_closed_dampers_is_prohibited() {
    let bus = Arc::new(EventBus::new());
    let mut states = bus.state_changed.subscribe();
    start_arbiter(&bus, &Settings::default()).await;

    let shut = VentilationState::shut();
    let mut replies = request(&bus, shut, Origin::Remote).await;
    assert_eq!(states.recv().await, Some(shut));

    request(&bus, VentilationState::new([Closed; 3], FanState::On), Origin::Remote).await;
    // The first request's sink is untouched; the second gets state + error.
    let mut second = request(&bus, VentilationState::new([Closed; 3], FanState::On), Origin::Local).await;
    assert_eq!(second.recv().await, Some(Reply::State(shut)));
    assert!(matches!(second.recv().await, Some(Reply::Error(ArbitrationError::Prohibited(_)))));
    assert!(replies.try_recv().is_err());
    assert!(states.try_recv().is_none(), "rejections publish nothing");

    bus.shutdown().await;
}

#[tokio::test]
async fn laser_lock_blocks_closing_damper1_for_everyone() {
    let bus = Arc::new(EventBus::new());
    let mut states = bus.state_changed.subscribe();
    start_arbiter(&bus, &Settings::default()).await;

    let running = VentilationState::new([Open, Closed, Closed], FanState::On);
    bus.change_requests.publish(ChangeRequest::local(running)).await;
    assert_eq!(states.recv().await, Some(running));

    bus.lock_changes.publish(LockChange::local(LockKind::Laser, true)).await;
    assert!(states.recv().await.is_some_and(|s| s.laser_lock && !s.olga_lock && s.fan.is_on()));

    let mut replies = request(&bus, VentilationState::shut(), Origin::Local).await;
    assert!(matches!(replies.recv().await, Some(Reply::State(s)) if s.laser_lock && s.fan.is_on()));
    assert!(matches!(replies.recv().await, Some(Reply::Error(ArbitrationError::Prohibited(_)))));

    bus.shutdown().await;
}

#[tokio::test]
async fn remote_client_cannot_set_olga_lock() {
    let bus = Arc::new(EventBus::new());
    let mut states = bus.state_changed.subscribe();
    start_arbiter(&bus, &Settings::default()).await;
    bus.change_requests.publish(ChangeRequest::local(VentilationState::shut())).await;
    states.recv().await;

    let (tx, mut replies) = mpsc::channel(10);
    let change = LockChange { kind: LockKind::Olga, active: true, origin: Origin::Remote, reply: Some(tx) };
    bus.lock_changes.publish(change).await;
    assert!(matches!(replies.recv().await, Some(Reply::State(s)) if !s.olga_lock));
    assert!(matches!(replies.recv().await, Some(Reply::Error(ArbitrationError::NotAuthorized(_)))));
    assert!(states.try_recv().is_none());

    bus.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn lock_expires_after_timeout_and_is_broadcast() {
    let bus = Arc::new(EventBus::new());
    let mut states = bus.state_changed.subscribe();
    let settings = Settings { lock_timeout: Duration::from_secs(60), ..Settings::default() };
    start_arbiter(&bus, &settings).await;

    bus.change_requests.publish(ChangeRequest::local(VentilationState::new([Open, Closed, Closed], FanState::On))).await;
    states.recv().await;

    let start = Instant::now();
    bus.lock_changes.publish(LockChange::local(LockKind::Laser, true)).await;
    assert!(states.recv().await.is_some_and(|s| s.laser_lock));

    assert!(states.recv().await.is_some_and(|s| !s.laser_lock));
    assert!(start.elapsed() >= Duration::from_secs(60));

    bus.shutdown().await;
}

async fn read_frame(link: &mut DuplexStream) -> [u8; 9] {
    let mut buf = [0u8; 9];
    link.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test(start_paused = true)]
async fn accepted_states_reach_controller_in_order_and_paced() {
    let bus = Arc::new(EventBus::new());
    let settings = Settings { min_cmd_interval: Duration::from_millis(1500), ..Settings::default() };
    let (ours, mut link) = duplex(1024);
    let (read_half, write_half) = tokio::io::split(ours);
    let driver = ActuatorDriver::new(Arc::clone(&bus), write_half, &settings);
    tokio::spawn(driver.run(read_half));
    wait_for_subscribers(&bus.state_changed, 1).await;
    start_arbiter(&bus, &settings).await;

    let start = Instant::now();
    bus.change_requests.publish(ChangeRequest::local(VentilationState::new([Open, Closed, Closed], FanState::Off))).await;
    bus.change_requests.publish(ChangeRequest::local(VentilationState::new([Open, HalfOpen, Closed], FanState::On))).await;

    assert_eq!(read_frame(&mut link).await, [b'>', 1, 6, 0, 0, 1, 0, 0, 0]);
    assert_eq!(read_frame(&mut link).await, [b'>', 1, 6, 0, 0, 1, 2, 0, 1]);
    assert!(start.elapsed() >= Duration::from_millis(1500));

    bus.shutdown().await;
}

#[tokio::test]
async fn fanout_broadcasts_every_accepted_state() {
    let bus = Arc::new(EventBus::new());
    tokio::spawn(StateFanout::new(Arc::clone(&bus)).run());
    wait_for_subscribers(&bus.snapshot_requests, 1).await;
    start_arbiter(&bus, &Settings::default()).await;
    let mut all = bus.json_to_all.subscribe();

    bus.change_requests.publish(ChangeRequest::local(VentilationState::new([Closed, Open, Closed], FanState::On))).await;
    let json: serde_json::Value = serde_json::from_str(&all.recv().await.unwrap()).unwrap();
    assert_eq!(json["ctx"], "ventchange");
    assert_eq!(json["data"]["Damper2"], "open");
    assert_eq!(json["data"]["Fan"], "on");

    bus.shutdown().await;
}
