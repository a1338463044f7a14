//! # Actuation Driver
//!
//! Turns every canonical state into a damper command frame and writes it to the
//! controller link.
//!
//! ## Pacing:
//!
//! The dampers are driven by motors that need time to reach their end stops. A frame
//! that moves any damper is held back until `min_cmd_interval` has passed since the
//! previous transmission; frames that only switch the fan go out at once. Held frames
//! are delayed, never dropped or merged, so the controller sees every accepted state
//! in order.
//!
//! Lines the controller prints back are classified with [`decode_line`] and logged.
//! They are read as raw bytes: line noise from a resetting controller is not text
//! and must not end the read side.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time::{sleep_until, Instant};

use crate::actuator::codec::{decode_line, encode_damper_cmd, InboundLine, MsgType};
use crate::configs::settings::Settings;
use crate::core::bus::EventBus;
use crate::core::model::VentilationState;

/// Errors that stop the driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Writing to the controller link failed.
    #[error("write to damper controller failed: {0}")]
    Write(#[source] std::io::Error),
}

/// # Actuator Driver
///
/// Owns the write half of the controller link.
pub struct ActuatorDriver<W> {
    bus: Arc<EventBus>,
    writer: W,
    target_id: u8,
    min_cmd_interval: Duration,
    last_state: Option<VentilationState>,
    last_sent: Option<Instant>,
}

impl<W: AsyncWrite + Unpin> ActuatorDriver<W> {
    /// Creates a driver writing to `writer`.
    pub fn new(bus: Arc<EventBus>, writer: W, settings: &Settings) -> Self {
        Self {
            bus,
            writer,
            target_id: settings.target_id,
            min_cmd_interval: settings.min_cmd_interval,
            last_state: None,
            last_sent: None,
        }
    }

    /// # Run
    ///
    /// Follows `state_changed` until shutdown, reading controller output from `reader`
    /// meanwhile. Returns an error when the link can no longer be written.
    pub async fn run<R: AsyncRead + Unpin>(mut self, reader: R) -> Result<(), DriverError> {
        let mut states = self.bus.state_changed.subscribe();
        let mut shutdown = self.bus.on_shutdown();
        let mut reader = Some(BufReader::new(reader));
        let mut line = Vec::new();
        log::info!("actuator: driver started (target id {}, min interval {:?})", self.target_id, self.min_cmd_interval);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("actuator: shutdown");
                    break Ok(());
                }
                Some(state) = states.recv() => {
                    if let Err(e) = self.transmit(&state).await {
                        log::error!("actuator: {}", e);
                        break Err(e);
                    }
                }
                inbound = next_inbound(&mut reader, &mut line) => match inbound {
                    Ok(Some(inbound)) => log_inbound(inbound),
                    Ok(None) => {
                        log::warn!("actuator: controller link closed its read side");
                        reader = None;
                    }
                    Err(e) => {
                        log::warn!("actuator: reading from controller failed: {}", e);
                        reader = None;
                    }
                },
            }
        };

        self.bus.state_changed.unsubscribe(states);
        result
    }

    /// # Transmit
    ///
    /// Encodes and writes one state, waiting out the command interval first when the
    /// frame moves a damper. Returns `false` when the state could not be encoded.
    pub async fn transmit(&mut self, state: &VentilationState) -> Result<bool, DriverError> {
        let frame = match encode_damper_cmd(state, self.target_id) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("actuator: dropping {}: {}", state, e);
                return Ok(false);
            }
        };

        let moves_dampers = !self.last_state.is_some_and(|last| last.same_dampers(state));
        if let (true, Some(last)) = (moves_dampers, self.last_sent) {
            let ready_at = last + self.min_cmd_interval;
            if ready_at > Instant::now() {
                log::debug!("actuator: holding damper command until interval elapsed");
                sleep_until(ready_at).await;
            }
        }

        log::debug!("actuator: to controller {:02x?}", frame.as_bytes());
        self.writer.write_all(frame.as_bytes()).await.map_err(DriverError::Write)?;
        self.writer.flush().await.map_err(DriverError::Write)?;
        self.last_state = Some(*state);
        self.last_sent = Some(Instant::now());
        Ok(true)
    }
}

/// Reads and classifies one line. `Ok(None)` at end of stream; pends forever once the
/// read side is gone. A partial line survives cancellation in `line`.
async fn next_inbound<R: AsyncRead + Unpin>(
    reader: &mut Option<BufReader<R>>,
    line: &mut Vec<u8>,
) -> std::io::Result<Option<InboundLine>> {
    let Some(reader) = reader else {
        return std::future::pending().await;
    };
    if reader.read_until(b'\n', line).await? == 0 {
        return Ok(None);
    }
    let inbound = decode_line(line);
    line.clear();
    Ok(Some(inbound))
}

fn log_inbound(inbound: InboundLine) {
    match inbound {
        InboundLine::Packet { msg_type: MsgType::Error, peer, payload, .. } => {
            log::warn!("actuator: controller {} reported an error: {:02x?}", peer, payload);
        }
        InboundLine::Packet { direction, peer, msg_type, payload } => {
            log::debug!("actuator: {:?} {:?} peer {} payload {:02x?}", direction, msg_type, peer, payload);
        }
        InboundLine::Text(text) if text.is_empty() => {}
        InboundLine::Text(text) => log::debug!("actuator: from controller: {}", text),
    }
}
