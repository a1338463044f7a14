//! # Client Session
//!
//! The two halves of one websocket client.
//!
//! ## Core Components:
//!
//! - **[`ClientConnection`]**: the read side. Decodes inbound text into change
//!   requests stamped with the client's origin and reply sink, and publishes them.
//! - **[`ClientSession`]**: the write side. A single task that owns the socket's sink
//!   and multiplexes the snapshot replay, the shared broadcast feed, the private
//!   reply queue, keep-alive pings and shutdown. Any failed write ends the session.
//!
//! The transport is abstracted behind [`ClientSink`] so the session can run against
//! anything that can carry text frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::core::bus::{EventBus, Subscription};
use crate::core::model::{ChangeRequest, LockChange, Origin, Reply, ReplySender, REPLY_QUEUE_CAPACITY};
use crate::fanout::wire::{decode_client_message, encode_reply, ClientCommand, WireError};

/// Interval between keep-alive pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(58);
/// A client that sends nothing (not even a pong) for this long is dropped.
pub const READ_TIMEOUT: Duration = Duration::from_secs(70);
/// Deadline for a single write to the client.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(9);

/// Reasons a session ends abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer is gone.
    #[error("client connection closed")]
    Closed,

    /// A write did not complete within [`WRITE_TIMEOUT`].
    #[error("write timed out")]
    WriteTimeout,

    /// The transport reported an error.
    #[error("transport error: {0}")]
    Transport(String),

    /// An outbound message could not be encoded.
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// # Client Sink
///
/// The write half of a client transport.
#[async_trait]
pub trait ClientSink: Send {
    /// Sends one text frame.
    async fn send_text(&mut self, text: Arc<str>) -> Result<(), SessionError>;

    /// Sends a keep-alive ping.
    async fn send_ping(&mut self) -> Result<(), SessionError>;

    /// Sends a close frame. Failures are ignored.
    async fn close(&mut self);
}

/// # Client Connection
///
/// The read side of one client. Cheap; owned by whatever reads the socket.
pub struct ClientConnection {
    id: u64,
    bus: Arc<EventBus>,
    origin: Origin,
    replies: ReplySender,
}

impl ClientConnection {
    /// Opens both halves for a new client. The returned receiver is the private reply
    /// queue to hand to [`ClientSession::new`].
    pub fn open(id: u64, bus: Arc<EventBus>, origin: Origin) -> (Self, mpsc::Receiver<Reply>) {
        let (replies, rx) = mpsc::channel(REPLY_QUEUE_CAPACITY);
        log::info!("fanout: client {} connected ({:?})", id, origin);
        (Self { id, bus, origin, replies }, rx)
    }

    /// # Handle Text
    ///
    /// Decodes one inbound message and publishes the resulting request(s). Malformed
    /// input is returned as an error and publishes nothing.
    pub async fn handle_text(&self, text: &str) -> Result<(), WireError> {
        match decode_client_message(text)? {
            ClientCommand::ChangeVentilation(state) => {
                log::debug!("fanout: client {} requests {}", self.id, state);
                let request = ChangeRequest::from_client(state, self.origin, self.replies.clone());
                self.bus.change_requests.publish(request).await;
            }
            ClientCommand::ChangeLocks(changes) => {
                for (kind, active) in changes {
                    log::debug!("fanout: client {} requests {} lock = {}", self.id, kind, active);
                    let change = LockChange { kind, active, origin: self.origin, reply: Some(self.replies.clone()) };
                    self.bus.lock_changes.publish(change).await;
                }
            }
        }
        Ok(())
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        log::info!("fanout: client {} disconnected", self.id);
    }
}

/// # Client Session
///
/// The write side of one client. Ends when the bus shuts down, when the
/// [`ClientConnection`] and every request it issued are gone, or on a write failure.
pub struct ClientSession<S> {
    id: u64,
    bus: Arc<EventBus>,
    sink: S,
    replies: mpsc::Receiver<Reply>,
}

impl<S: ClientSink> ClientSession<S> {
    /// Binds a sink to the client's reply queue.
    pub fn new(id: u64, bus: Arc<EventBus>, sink: S, replies: mpsc::Receiver<Reply>) -> Self {
        Self { id, bus, sink, replies }
    }

    /// # Run
    ///
    /// The snapshot request goes out after subscribing to the broadcast feed, and the
    /// snapshot is preferred whenever both are ready. Broadcasts the snapshot already
    /// covers are skipped, so the client never sees an older state after a newer one.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut shutdown = self.bus.on_shutdown();
        let mut broadcasts = self.bus.json_to_all.subscribe();
        let (snapshot_tx, mut snapshot_rx) = mpsc::channel(1);
        self.bus.snapshot_requests.publish(snapshot_tx).await;

        let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            let step = tokio::select! {
                biased;
                _ = &mut shutdown => break Ok(()),
                Some(json) = snapshot_rx.recv() => self.write_snapshot(json, &mut broadcasts).await,
                Some(json) = broadcasts.recv() => self.write(json).await,
                reply = self.replies.recv() => match reply {
                    Some(reply) => match encode_reply(&reply) {
                        Ok(json) => self.write(json).await,
                        Err(e) => Err(e.into()),
                    },
                    None => break Ok(()),
                },
                _ = ping.tick() => self.ping().await,
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        self.bus.json_to_all.unsubscribe(broadcasts);
        match &result {
            Ok(()) => self.sink.close().await,
            Err(e) => log::info!("fanout: client {} session ended: {}", self.id, e),
        }
        result
    }

    /// Writes the snapshot followed by whatever is queued behind it. The fanout hands
    /// out the very `Arc` it broadcast, so queued entries up to and including that one
    /// are stale; without a match every queued entry is newer than the snapshot.
    async fn write_snapshot(
        &mut self,
        snapshot: Arc<str>,
        broadcasts: &mut Subscription<Arc<str>>,
    ) -> Result<(), SessionError> {
        let mut queued = Vec::new();
        while let Some(json) = broadcasts.try_recv() {
            queued.push(json);
        }
        let newer = match queued.iter().position(|json| Arc::ptr_eq(json, &snapshot)) {
            Some(i) => queued.split_off(i + 1),
            None => queued,
        };
        self.write(snapshot).await?;
        for json in newer {
            self.write(json).await?;
        }
        Ok(())
    }

    async fn write(&mut self, json: Arc<str>) -> Result<(), SessionError> {
        timeout(WRITE_TIMEOUT, self.sink.send_text(json)).await.map_err(|_| SessionError::WriteTimeout)?
    }

    async fn ping(&mut self) -> Result<(), SessionError> {
        timeout(WRITE_TIMEOUT, self.sink.send_ping()).await.map_err(|_| SessionError::WriteTimeout)?
    }
}
