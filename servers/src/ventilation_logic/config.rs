use clap::Parser;
use lib_vent::configs::settings::{
    MqttTopics, Settings, SettingsError, DEFAULT_BAUD, DEFAULT_MQTT_BROKER, DEFAULT_MQTT_CLIENT_ID,
    DEFAULT_TARGET_ID, DEFAULT_TTY,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "server_ventilation.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Ventilation control server: dampers, fan, interlocks and web clients", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "VENT_PORT", help = "Port to listen on for websocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "VENT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "VENT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "VENT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "VENT_DEBUG", help = "Debug flags separated by ',' (WEB, VENT, SERIAL, MQTT, BUS) or ALL.")]
    pub debug: Option<String>,

    #[clap(long, env = "VENT_MQTT_BROKER", help = "MQTT broker, tcp://host:port.")]
    pub mqtt_broker: Option<String>,

    #[clap(long, env = "VENT_MQTT_CLIENT_ID", help = "MQTT client id.")]
    pub mqtt_client_id: Option<String>,

    #[clap(long, env = "VENT_MQTT_RECONNECT_BACKOFF_SECS", help = "Seconds to wait between failed broker connection attempts.")]
    pub mqtt_reconnect_backoff_secs: Option<u64>,

    #[clap(long, env = "VENT_MQTT_TOPIC_LASER", help = "Topic of the laser cutter in-use feed.")]
    pub mqtt_topic_laser: Option<String>,

    #[clap(long, env = "VENT_MQTT_TOPIC_PRESENCE", help = "Topic of the presence feed.")]
    pub mqtt_topic_presence: Option<String>,

    #[clap(long, env = "VENT_MQTT_TOPIC_VENTILATION", help = "Topic the ventilation state is published on.")]
    pub mqtt_topic_ventilation: Option<String>,

    #[clap(long, env = "VENT_LOCAL_TOKEN", help = "Token identifying the local touch panel.")]
    pub local_token: Option<String>,

    #[clap(long, env = "VENT_TTY", help = "Serial device of the damper controller.")]
    pub tty: Option<PathBuf>,

    #[clap(long, env = "VENT_BAUD", help = "Serial line speed.")]
    pub baud: Option<u32>,

    #[clap(long, env = "VENT_TARGET_ID", help = "Bus id of the damper controller.")]
    pub target_id: Option<u8>,

    #[clap(long, env = "VENT_MIN_INTERVAL_MS", help = "Minimum milliseconds between two damper commands.")]
    pub min_interval_ms: Option<u64>,

    #[clap(long, env = "VENT_LOCK_TIMEOUT_SECS", help = "Seconds until a Laser or OLGA lock expires.")]
    pub lock_timeout_secs: Option<u64>,

    #[clap(long, env = "VENT_AUTO_OFF_TIMEOUT_SECS", help = "Seconds after everybody left until the ventilation is switched off.")]
    pub auto_off_timeout_secs: Option<u64>,

    #[clap(long, env = "VENT_STATIC_DIR", help = "Directory with the web UI to serve at /.")]
    pub static_dir: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            debug: other.debug.or(self.debug),
            mqtt_broker: other.mqtt_broker.or(self.mqtt_broker),
            mqtt_client_id: other.mqtt_client_id.or(self.mqtt_client_id),
            mqtt_reconnect_backoff_secs: other.mqtt_reconnect_backoff_secs.or(self.mqtt_reconnect_backoff_secs),
            mqtt_topic_laser: other.mqtt_topic_laser.or(self.mqtt_topic_laser),
            mqtt_topic_presence: other.mqtt_topic_presence.or(self.mqtt_topic_presence),
            mqtt_topic_ventilation: other.mqtt_topic_ventilation.or(self.mqtt_topic_ventilation),
            local_token: other.local_token.or(self.local_token),
            tty: other.tty.or(self.tty),
            baud: other.baud.or(self.baud),
            target_id: other.target_id.or(self.target_id),
            min_interval_ms: other.min_interval_ms.or(self.min_interval_ms),
            lock_timeout_secs: other.lock_timeout_secs.or(self.lock_timeout_secs),
            auto_off_timeout_secs: other.auto_off_timeout_secs.or(self.auto_off_timeout_secs),
            static_dir: other.static_dir.or(self.static_dir),
        }
    }

    /// Converts the merged configuration into validated runtime settings.
    pub fn to_settings(&self) -> Result<Settings, SettingsError> {
        let defaults = Settings::default();
        let topics = MqttTopics::default();
        Settings {
            port: self.port.unwrap_or(defaults.port),
            mqtt_broker: self.mqtt_broker.clone().unwrap_or(defaults.mqtt_broker),
            mqtt_client_id: self.mqtt_client_id.clone().unwrap_or(defaults.mqtt_client_id),
            mqtt_reconnect_backoff: self
                .mqtt_reconnect_backoff_secs
                .map_or(defaults.mqtt_reconnect_backoff, Duration::from_secs),
            topics: MqttTopics {
                laser_cutter: self.mqtt_topic_laser.clone().unwrap_or(topics.laser_cutter),
                presence: self.mqtt_topic_presence.clone().unwrap_or(topics.presence),
                ventilation: self.mqtt_topic_ventilation.clone().unwrap_or(topics.ventilation),
            },
            local_token: self.local_token.clone(),
            tty: self.tty.clone().unwrap_or(defaults.tty),
            baud: self.baud.unwrap_or(defaults.baud),
            target_id: self.target_id.unwrap_or(defaults.target_id),
            min_cmd_interval: self.min_interval_ms.map_or(defaults.min_cmd_interval, Duration::from_millis),
            lock_timeout: self.lock_timeout_secs.map_or(defaults.lock_timeout, Duration::from_secs),
            auto_off_timeout: self.auto_off_timeout_secs.map_or(defaults.auto_off_timeout, Duration::from_secs),
            static_dir: self.static_dir.clone(),
        }
        .validate()
    }
}

fn default_config() -> Config {
    Config {
        port: Some(8080),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        mqtt_broker: Some(DEFAULT_MQTT_BROKER.to_string()),
        mqtt_client_id: Some(DEFAULT_MQTT_CLIENT_ID.to_string()),
        mqtt_reconnect_backoff_secs: Some(300),
        tty: Some(PathBuf::from(DEFAULT_TTY)),
        baud: Some(DEFAULT_BAUD),
        target_id: Some(DEFAULT_TARGET_ID),
        min_interval_ms: Some(1500),
        lock_timeout_secs: Some(30 * 60),
        auto_off_timeout_secs: Some(2 * 60),
        ..Default::default()
    }
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        eprintln!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path).map(|s| serde_json::from_str::<Config>(&s)) {
        Ok(Ok(config)) => Some(config),
        Ok(Err(e)) => {
            eprintln!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
        Err(e) => {
            eprintln!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the config file and `cli` (which already carries env vars).
pub fn load_config_with(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = default_config();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

pub fn load_config() -> Config {
    load_config_with(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 9000, "minIntervalMs": 2000, "localToken": "panel"}}"#).unwrap();

        let cli = Config { config_path: Some(file.path().to_path_buf()), port: Some(9100), ..Default::default() };
        let config = load_config_with(cli);

        assert_eq!(config.port, Some(9100));
        assert_eq!(config.min_interval_ms, Some(2000));
        assert_eq!(config.lock_timeout_secs, Some(1800));

        let settings = config.to_settings().unwrap();
        assert_eq!(settings.min_cmd_interval, Duration::from_millis(2000));
        assert!(settings.is_local_token(Some("panel")));
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "port = 9000").unwrap();
        let config = load_config_with(Config { config_path: Some(file.path().to_path_buf()), ..Default::default() });
        assert_eq!(config, Config { config_path: Some(file.path().to_path_buf()), ..default_config() });
    }

    #[test]
    fn defaults_produce_the_default_settings() {
        let settings = default_config().to_settings().unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn invalid_values_are_reported() {
        let config = Config { lock_timeout_secs: Some(0), ..default_config() };
        assert!(matches!(config.to_settings(), Err(SettingsError::ZeroDuration(_))));
    }
}
