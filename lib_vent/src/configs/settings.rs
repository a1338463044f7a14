//! # Runtime Settings
//!
//! One immutable record, built once at startup and handed by reference to every
//! actor constructor. Front ends (CLI, config file) produce it through
//! [`Settings::validate`], which rejects values the actors cannot work with.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default MQTT broker.
pub const DEFAULT_MQTT_BROKER: &str = "tcp://mqtt.realraum.at:1883";
/// Default MQTT client id.
pub const DEFAULT_MQTT_CLIENT_ID: &str = "ventilation";
/// Default serial device of the damper controller.
pub const DEFAULT_TTY: &str = "/dev/ttyACM0";
/// Serial line speed of the damper controller.
pub const DEFAULT_BAUD: u32 = 9600;
/// Bus id of the damper controller.
pub const DEFAULT_TARGET_ID: u8 = 1;

/// Errors found while validating settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// A duration that has to be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// The broker address is not `tcp://host:port` or `host:port`.
    #[error("invalid MQTT broker address '{0}', expected tcp://host:port")]
    InvalidBroker(String),

    /// A required string is empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// MQTT topic names used by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttTopics {
    /// Laser cutter in-use feed, `{"IsHot":bool}`.
    pub laser_cutter: String,
    /// Space presence feed, `{"Present":bool}`.
    pub presence: String,
    /// Where every canonical state is republished.
    pub ventilation: String,
}

impl Default for MqttTopics {
    fn default() -> Self {
        Self {
            laser_cutter: "realraum/lasercutter/cardpresent".to_string(),
            presence: "realraum/metaevt/presence".to_string(),
            ventilation: "realraum/ventilation/ventilation".to_string(),
        }
    }
}

/// # Settings
///
/// Everything the control plane needs to know at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// HTTP/websocket listen port.
    pub port: u16,
    /// Broker address, `tcp://host:port`.
    pub mqtt_broker: String,
    /// Client id presented to the broker.
    pub mqtt_client_id: String,
    /// Fixed wait between failed broker connection attempts.
    pub mqtt_reconnect_backoff: Duration,
    /// Topic names.
    pub topics: MqttTopics,
    /// Websocket clients presenting this token are treated as `Local`. `None` disables it.
    pub local_token: Option<String>,
    /// Serial device of the damper controller.
    pub tty: PathBuf,
    /// Serial line speed.
    pub baud: u32,
    /// Bus id the damper commands are addressed to.
    pub target_id: u8,
    /// Minimum spacing between two damper-moving commands.
    pub min_cmd_interval: Duration,
    /// Lifetime of a Laser or OLGA lock after its last activation.
    pub lock_timeout: Duration,
    /// Delay between the space becoming empty and the automatic shut-off.
    pub auto_off_timeout: Duration,
    /// Directory served at `/`, if any.
    pub static_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            mqtt_broker: DEFAULT_MQTT_BROKER.to_string(),
            mqtt_client_id: DEFAULT_MQTT_CLIENT_ID.to_string(),
            mqtt_reconnect_backoff: Duration::from_secs(5 * 60),
            topics: MqttTopics::default(),
            local_token: None,
            tty: PathBuf::from(DEFAULT_TTY),
            baud: DEFAULT_BAUD,
            target_id: DEFAULT_TARGET_ID,
            min_cmd_interval: Duration::from_millis(1500),
            lock_timeout: Duration::from_secs(30 * 60),
            auto_off_timeout: Duration::from_secs(2 * 60),
            static_dir: None,
        }
    }
}

impl Settings {
    /// Checks the record and returns it unchanged when usable.
    ///
    /// An empty `local_token` is normalized to `None` so an unset token never matches.
    pub fn validate(mut self) -> Result<Self, SettingsError> {
        if self.lock_timeout.is_zero() {
            return Err(SettingsError::ZeroDuration("lock_timeout"));
        }
        if self.auto_off_timeout.is_zero() {
            return Err(SettingsError::ZeroDuration("auto_off_timeout"));
        }
        if self.mqtt_reconnect_backoff.is_zero() {
            return Err(SettingsError::ZeroDuration("mqtt_reconnect_backoff"));
        }
        if self.mqtt_client_id.is_empty() {
            return Err(SettingsError::Empty("mqtt_client_id"));
        }
        if self.tty.as_os_str().is_empty() {
            return Err(SettingsError::Empty("tty"));
        }
        self.broker_host_port()?;
        if self.local_token.as_deref().is_some_and(str::is_empty) {
            self.local_token = None;
        }
        Ok(self)
    }

    /// Splits `mqtt_broker` into host and port.
    pub fn broker_host_port(&self) -> Result<(String, u16), SettingsError> {
        let invalid = || SettingsError::InvalidBroker(self.mqtt_broker.clone());
        let addr = self.mqtt_broker.strip_prefix("tcp://").unwrap_or(&self.mqtt_broker);
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok((host.to_string(), port))
    }

    /// `true` when `token` matches the configured local token.
    pub fn is_local_token(&self, token: Option<&str>) -> bool {
        match (&self.local_token, token) {
            (Some(expected), Some(given)) => !expected.is_empty() && expected == given,
            _ => false,
        }
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings
    Port: {},
    MQTT broker: {} (client id {}),
    Serial: {} @ {} baud, target id {},
    Min command interval: {:?},
    Lock timeout: {:?},
    Auto-off timeout: {:?},
    Local token: {}",
            self.port,
            self.mqtt_broker,
            self.mqtt_client_id,
            self.tty.display(),
            self.baud,
            self.target_id,
            self.min_cmd_interval,
            self.lock_timeout,
            self.auto_off_timeout,
            if self.local_token.is_some() { "set" } else { "unset" },
        )
    }
}
