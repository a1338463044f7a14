//! Serial transport for the damper controller.

use std::path::Path;

use tokio::io::{split, ReadHalf, WriteHalf};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Opens `path` at `baud` (8N1) and splits it into read and write halves for
/// [`ActuatorDriver`](crate::actuator::ActuatorDriver).
pub fn open_serial(path: &Path, baud: u32) -> tokio_serial::Result<(ReadHalf<SerialStream>, WriteHalf<SerialStream>)> {
    let port = tokio_serial::new(path.to_string_lossy(), baud).open_native_async()?;
    log::info!("actuator: opened {} at {} baud", path.display(), baud);
    Ok(split(port))
}
