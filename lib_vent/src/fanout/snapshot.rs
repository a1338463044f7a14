//! # State Fanout
//!
//! Re-encodes every canonical state once for all clients and remembers the last
//! broadcast so late joiners can be brought up to date.

use std::sync::Arc;

use crate::core::bus::EventBus;
use crate::fanout::wire::{encode_state, INITIAL_SNAPSHOT};

/// # State Fanout
///
/// Actor owning the last-broadcast snapshot.
pub struct StateFanout {
    bus: Arc<EventBus>,
    last: Arc<str>,
}

impl StateFanout {
    /// Seeds the snapshot with an empty `ventchange` message.
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus, last: Arc::from(INITIAL_SNAPSHOT) }
    }

    /// Main loop. Returns after the bus shutdown signal.
    pub async fn run(mut self) {
        let mut states = self.bus.state_changed.subscribe();
        let mut requests = self.bus.snapshot_requests.subscribe();
        let mut shutdown = self.bus.on_shutdown();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("fanout: shutdown");
                    break;
                }
                Some(state) = states.recv() => match encode_state(&state) {
                    Ok(json) => {
                        self.last = Arc::clone(&json);
                        let n = self.bus.json_to_all.publish(json).await;
                        log::debug!("fanout: state sent to {} client(s)", n);
                    }
                    Err(e) => log::error!("fanout: cannot encode {}: {}", state, e),
                },
                Some(sink) = requests.recv() => {
                    if sink.try_send(Arc::clone(&self.last)).is_err() {
                        log::debug!("fanout: client left before its snapshot was sent");
                    }
                }
            }
        }

        self.bus.state_changed.unsubscribe(states);
        self.bus.snapshot_requests.unsubscribe(requests);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{DamperPosition::*, FanState, VentilationState};
    use tokio::sync::mpsc;

    async fn snapshot(bus: &EventBus) -> Arc<str> {
        let (tx, mut rx) = mpsc::channel(1);
        bus.snapshot_requests.publish(tx).await;
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn replays_last_broadcast_to_late_joiners() {
        let bus = Arc::new(EventBus::new());
        let task = tokio::spawn(StateFanout::new(Arc::clone(&bus)).run());
        while bus.snapshot_requests.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(&*snapshot(&bus).await, INITIAL_SNAPSHOT);

        let mut all = bus.json_to_all.subscribe();
        let state = VentilationState::new([Open, Closed, Closed], FanState::On);
        bus.state_changed.publish(state).await;
        let broadcast = all.recv().await.unwrap();
        assert_eq!(broadcast, encode_state(&state).unwrap());
        assert_eq!(snapshot(&bus).await, broadcast);

        bus.shutdown().await;
        task.await.unwrap();
    }
}
