//! # MQTT Bridge
//!
//! Connects to the building broker and keeps local operation independent of it.
//!
//! ## Connection Policy:
//!
//! Until the first successful connection a failed attempt waits the configured fixed
//! backoff (five minutes by default) before trying again. Once connected, the client
//! library's own reconnect takes over with a short pause between attempts, and the
//! feed subscriptions are renewed on every `ConnAck`. Canonical states produced while
//! the broker is unreachable are not queued for later.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::time::Instant;

use crate::bridge::events::{decode_input, BridgeError, VentilationRecord};
use crate::bridge::relay::FeedRelay;
use crate::configs::settings::{MqttTopics, Settings};
use crate::core::arbiter::sleep_until_deadline;
use crate::core::bus::EventBus;
use crate::core::model::VentilationState;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;
const RECONNECT_PAUSE: Duration = Duration::from_secs(1);

/// # MQTT Bridge
///
/// The actor connecting the bus to the broker.
pub struct MqttBridge {
    bus: Arc<EventBus>,
    client_id: String,
    broker: (String, u16),
    backoff: Duration,
    topics: MqttTopics,
    relay: FeedRelay,
}

impl MqttBridge {
    /// Fails only when the broker address in `settings` is unusable.
    pub fn new(bus: Arc<EventBus>, settings: &Settings) -> Result<Self, BridgeError> {
        Ok(Self {
            broker: settings.broker_host_port()?,
            client_id: settings.mqtt_client_id.clone(),
            backoff: settings.mqtt_reconnect_backoff,
            topics: settings.topics.clone(),
            relay: FeedRelay::new(Arc::clone(&bus), settings.auto_off_timeout),
            bus,
        })
    }

    /// Main loop. Returns after the bus shutdown signal.
    pub async fn run(mut self) {
        let (host, port) = self.broker.clone();
        log::info!("bridge: connecting to {}:{} as '{}'", host, port, self.client_id);
        let mut options = MqttOptions::new(self.client_id.clone(), host, port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let mut states = self.bus.state_changed.subscribe();
        let mut shutdown = self.bus.on_shutdown();
        let mut link = BrokerLink::new(self.backoff);
        let mut retry_at: Option<Instant> = None;

        loop {
            let auto_off = self.relay.next_deadline();
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("bridge: shutdown");
                    break;
                }
                Some(state) = states.recv() => {
                    if link.is_connected() {
                        self.republish(&client, state);
                    } else {
                        log::debug!("bridge: broker unreachable, not republishing {}", state);
                    }
                }
                event = eventloop.poll(), if retry_at.is_none() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        log::info!("bridge: connected to broker");
                        link.on_connected();
                        self.subscribe_feeds(&client);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match decode_input(&self.topics, &publish.topic, &publish.payload) {
                            Ok(Some(input)) => self.relay.handle(input, Instant::now()).await,
                            Ok(None) => {}
                            Err(e) => log::warn!("bridge: {}", e),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let wait = link.on_failure();
                        log::warn!("bridge: broker connection failed: {}; retrying in {:?}", e, wait);
                        retry_at = Some(Instant::now() + wait);
                    }
                },
                _ = sleep_until_deadline(retry_at) => retry_at = None,
                _ = sleep_until_deadline(auto_off) => self.relay.on_deadline(Instant::now()).await,
            }
        }

        if link.is_connected() {
            let _ = client.try_disconnect();
        }
        self.bus.state_changed.unsubscribe(states);
    }

    fn subscribe_feeds(&self, client: &AsyncClient) {
        for topic in [&self.topics.laser_cutter, &self.topics.presence] {
            if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                log::error!("bridge: subscribe to '{}' failed: {}", topic, e);
            }
        }
    }

    fn republish(&self, client: &AsyncClient, state: VentilationState) {
        let payload = match serde_json::to_vec(&VentilationRecord::now(state)) {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("bridge: cannot encode {}: {}", state, e);
                return;
            }
        };
        if let Err(e) = client.try_publish(self.topics.ventilation.as_str(), QoS::AtMostOnce, false, payload) {
            log::warn!("bridge: publish dropped: {}", e);
        }
    }
}

/// Connection bookkeeping behind the retry policy.
#[derive(Debug)]
struct BrokerLink {
    backoff: Duration,
    connected: bool,
    connected_once: bool,
}

impl BrokerLink {
    fn new(backoff: Duration) -> Self {
        Self { backoff, connected: false, connected_once: false }
    }

    fn on_connected(&mut self) {
        self.connected = true;
        self.connected_once = true;
    }

    /// Marks the link down and returns how long to wait before the next attempt.
    fn on_failure(&mut self) -> Duration {
        self.connected = false;
        if self.connected_once {
            RECONNECT_PAUSE
        } else {
            self.backoff
        }
    }

    /// States are republished only while the broker is reachable.
    fn is_connected(&self) -> bool {
        self.connected
    }
}
