//! Hub configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use common::config::ObservabilityConfig;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket + info API) bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default hub instance ID prefix.
pub const DEFAULT_HUB_ID_PREFIX: &str = "hub";

/// Default maximum concurrent signaling connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 500;

/// Default deadline for a pending client operation.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Default recording output directory.
pub const DEFAULT_RECORDING_DIR: &str = "recordings";

/// Default encoder binary.
pub const DEFAULT_ENCODER_PATH: &str = "ffmpeg";

/// Default address the encoder listens on for captured RTP.
pub const DEFAULT_CAPTURE_IP: &str = "127.0.0.1";

/// Default capture port range (inclusive).
pub const DEFAULT_CAPTURE_PORT_MIN: u16 = 20000;
pub const DEFAULT_CAPTURE_PORT_MAX: u16 = 20999;

/// Default delay between encoder spawn and consumer resume.
pub const DEFAULT_RECORDING_START_DELAY_MS: u64 = 1000;

/// Default delay between consumer close and the graceful stop signal.
pub const DEFAULT_RECORDING_FLUSH_DELAY_MS: u64 = 500;

/// Default time the encoder gets to exit after the graceful stop signal.
pub const DEFAULT_RECORDING_KILL_TIMEOUT_SECONDS: u64 = 5;

/// Hub configuration.
#[derive(Clone)]
pub struct Config {
    /// Unique identifier for this hub instance.
    pub hub_id: String,

    /// Signaling server bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Optional shared token clients must present in `register`.
    /// Protected by `SecretString` to prevent accidental logging.
    pub access_token: Option<SecretString>,

    /// Maximum concurrent signaling connections.
    pub max_connections: usize,

    /// Deadline for a pending client operation.
    pub request_timeout: Duration,

    /// Recording settings.
    pub recording: RecordingConfig,

    /// Logging settings.
    pub observability: ObservabilityConfig,
}

/// Recording controller settings.
#[derive(Debug, Clone)]
pub struct RecordingConfig {
    /// Whether recording is wanted at all. The encoder probe can still
    /// disable it at startup.
    pub enabled: bool,

    /// Directory for output files and capture descriptions.
    pub output_dir: PathBuf,

    /// Encoder binary (path or name on `PATH`).
    pub encoder_path: String,

    /// Address the encoder listens on for captured RTP.
    pub capture_ip: IpAddr,

    /// Inclusive capture port range.
    pub port_min: u16,
    pub port_max: u16,

    /// Delay between encoder spawn and consumer resume.
    pub start_delay: Duration,

    /// Delay between consumer close and the graceful stop signal.
    pub flush_delay: Duration,

    /// Time the encoder gets to exit after the graceful stop signal.
    pub kill_timeout: Duration,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from(DEFAULT_RECORDING_DIR),
            encoder_path: DEFAULT_ENCODER_PATH.to_string(),
            capture_ip: IpAddr::from([127, 0, 0, 1]),
            port_min: DEFAULT_CAPTURE_PORT_MIN,
            port_max: DEFAULT_CAPTURE_PORT_MAX,
            start_delay: Duration::from_millis(DEFAULT_RECORDING_START_DELAY_MS),
            flush_delay: Duration::from_millis(DEFAULT_RECORDING_FLUSH_DELAY_MS),
            kill_timeout: Duration::from_secs(DEFAULT_RECORDING_KILL_TIMEOUT_SECONDS),
        }
    }
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("hub_id", &self.hub_id)
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("max_connections", &self.max_connections)
            .field("request_timeout", &self.request_timeout)
            .field("recording", &self.recording)
            .field("observability", &self.observability)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let signaling_bind_address = vars
            .get("HUB_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("HUB_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let access_token = vars
            .get("HUB_ACCESS_TOKEN")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        let max_connections = vars
            .get("HUB_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let request_timeout = Duration::from_secs(
            vars.get("HUB_REQUEST_TIMEOUT_SECONDS")
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        );

        let recording = recording_from_vars(vars)?;

        // Generate hub_id if not provided
        let hub_id = vars.get("HUB_ID").cloned().unwrap_or_else(|| {
            let hostname = vars
                .get("HOSTNAME")
                .cloned()
                .unwrap_or_else(|| "local".to_string());
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!(
                "{DEFAULT_HUB_ID_PREFIX}-{hostname}-{}",
                suffix.get(..8).unwrap_or(&suffix)
            )
        });

        Ok(Config {
            hub_id,
            signaling_bind_address,
            health_bind_address,
            access_token,
            max_connections,
            request_timeout,
            recording,
            observability: ObservabilityConfig::from_vars(vars),
        })
    }
}

fn recording_from_vars(vars: &HashMap<String, String>) -> Result<RecordingConfig, ConfigError> {
    let defaults = RecordingConfig::default();

    let enabled = vars
        .get("HUB_RECORDING_ENABLED")
        .map_or(defaults.enabled, |s| {
            !matches!(s.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
        });

    let output_dir = vars
        .get("HUB_RECORDING_DIR")
        .map_or(defaults.output_dir, PathBuf::from);

    let encoder_path = vars
        .get("HUB_ENCODER_PATH")
        .cloned()
        .unwrap_or(defaults.encoder_path);

    let capture_ip = match vars.get("HUB_CAPTURE_IP") {
        Some(raw) => raw.parse().map_err(|e| {
            ConfigError::InvalidValue(format!("HUB_CAPTURE_IP '{raw}': {e}"))
        })?,
        None => defaults.capture_ip,
    };

    let port_min = parse_port(vars, "HUB_CAPTURE_PORT_MIN", defaults.port_min)?;
    let port_max = parse_port(vars, "HUB_CAPTURE_PORT_MAX", defaults.port_max)?;
    // Need at least one RTP/RTCP pair starting on an even port.
    let first_even = port_min.saturating_add(port_min % 2);
    if port_max <= first_even {
        return Err(ConfigError::InvalidValue(format!(
            "capture port range {port_min}-{port_max} holds no RTP/RTCP pair"
        )));
    }

    let start_delay = vars
        .get("HUB_RECORDING_START_DELAY_MS")
        .and_then(|s| s.parse().ok())
        .map_or(defaults.start_delay, Duration::from_millis);

    let flush_delay = vars
        .get("HUB_RECORDING_FLUSH_DELAY_MS")
        .and_then(|s| s.parse().ok())
        .map_or(defaults.flush_delay, Duration::from_millis);

    let kill_timeout = vars
        .get("HUB_RECORDING_KILL_TIMEOUT_SECONDS")
        .and_then(|s| s.parse().ok())
        .map_or(defaults.kill_timeout, Duration::from_secs);

    Ok(RecordingConfig {
        enabled,
        output_dir,
        encoder_path,
        capture_ip,
        port_min,
        port_max,
        start_delay,
        flush_delay,
        kill_timeout,
    })
}

fn parse_port(
    vars: &HashMap<String, String>,
    key: &str,
    default: u16,
) -> Result<u16, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .parse::<u16>()
            .ok()
            .filter(|p| *p >= 1024)
            .ok_or_else(|| ConfigError::InvalidValue(format!("{key} '{raw}' is not a port >= 1024"))),
        None => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(&HashMap::new()).unwrap();

        assert_eq!(config.signaling_bind_address, DEFAULT_SIGNALING_BIND_ADDRESS);
        assert_eq!(config.health_bind_address, DEFAULT_HEALTH_BIND_ADDRESS);
        assert!(config.access_token.is_none());
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert!(config.recording.enabled);
        assert_eq!(config.recording.encoder_path, "ffmpeg");
        assert_eq!(config.recording.port_min, 20000);
        assert_eq!(config.recording.port_max, 20999);
        assert_eq!(config.recording.start_delay, Duration::from_millis(1000));
        assert_eq!(config.recording.flush_delay, Duration::from_millis(500));
        assert_eq!(config.recording.kill_timeout, Duration::from_secs(5));
        assert!(config.hub_id.starts_with("hub-local-"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_vars(&vars(&[
            ("HUB_ID", "hub-test"),
            ("HUB_SIGNALING_BIND_ADDRESS", "127.0.0.1:4000"),
            ("HUB_ACCESS_TOKEN", "letmein"),
            ("HUB_MAX_CONNECTIONS", "3"),
            ("HUB_REQUEST_TIMEOUT_SECONDS", "2"),
            ("HUB_RECORDING_ENABLED", "false"),
            ("HUB_RECORDING_DIR", "/tmp/rec"),
            ("HUB_CAPTURE_PORT_MIN", "30000"),
            ("HUB_CAPTURE_PORT_MAX", "30010"),
            ("HUB_RECORDING_KILL_TIMEOUT_SECONDS", "1"),
        ]))
        .unwrap();

        assert_eq!(config.hub_id, "hub-test");
        assert_eq!(config.signaling_bind_address, "127.0.0.1:4000");
        assert_eq!(
            config.access_token.as_ref().unwrap().expose_secret(),
            "letmein"
        );
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert!(!config.recording.enabled);
        assert_eq!(config.recording.output_dir, PathBuf::from("/tmp/rec"));
        assert_eq!(config.recording.port_min, 30000);
        assert_eq!(config.recording.kill_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_unparseable_numbers_fall_back_to_defaults() {
        let config = Config::from_vars(&vars(&[
            ("HUB_MAX_CONNECTIONS", "lots"),
            ("HUB_REQUEST_TIMEOUT_SECONDS", "0"),
        ]))
        .unwrap();

        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_capture_ip_rejected() {
        let err = Config::from_vars(&vars(&[("HUB_CAPTURE_IP", "not-an-ip")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_empty_port_range_rejected() {
        let err = Config::from_vars(&vars(&[
            ("HUB_CAPTURE_PORT_MIN", "30001"),
            ("HUB_CAPTURE_PORT_MAX", "30002"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));

        let err = Config::from_vars(&vars(&[("HUB_CAPTURE_PORT_MIN", "80")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn test_debug_redacts_access_token() {
        let config = Config::from_vars(&vars(&[("HUB_ACCESS_TOKEN", "super-secret")])).unwrap();
        let debug = format!("{config:?}");

        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super-secret"));
    }
}
