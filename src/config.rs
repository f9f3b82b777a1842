//! Config modules for the application.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "telemetry-relay.toml";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Relay behaviour: which device ids map to which role, liveness probing.
    ///
    /// ```toml
    /// [relay]
    /// ping_interval_secs = 25
    /// chair_device_id = "chair_01"
    /// camera_device_id = "camera_01"
    /// control_type = "camera_control"
    /// ```
    #[serde(default)]
    pub relay: RelayConfig,
}

impl AppConfig {
    pub fn from_toml_str(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<std::path::Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = Self::from_toml_str(&contents)
            .map_err(|e| format!("Failed to parse config file: {e}"))?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        // Try to load from standard locations in order: CWD > .config > /etc
        let config_paths = [
            PathBuf::from(CONFIG_FILE_NAME),
            dirs::config_dir()
                .map(|config_dir| config_dir.join(CONFIG_FILE_NAME))
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME)),
            PathBuf::from("/etc/telemetry-relay").join(CONFIG_FILE_NAME),
        ];

        let mut config = None;
        for path in &config_paths {
            if path.exists() {
                match Self::from_file(path) {
                    Ok(loaded) => {
                        tracing::info!("Loaded configuration from: {}", path.display());
                        config = Some(loaded);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to load config from {}: {}. Falling back to defaults.",
                            path.display(),
                            e
                        );
                    }
                }
                // Only try the first existing config file
                break;
            }
        }

        let mut config = config.unwrap_or_else(|| {
            tracing::info!("No configuration file found, using defaults");
            Self::default()
        });
        config.apply_env_overrides(std::env::var("PORT").ok().as_deref());
        config.validate_and_fix();
        config
    }

    /// `PORT` wins over the file so container platforms can pick the listener port.
    pub fn apply_env_overrides(&mut self, port: Option<&str>) {
        if let Some(raw) = port {
            match raw.trim().parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Using PORT={} from environment", port);
                    self.server.port = port;
                }
                Err(e) => {
                    tracing::warn!("Ignoring invalid PORT value {:?}: {}", raw, e);
                }
            }
        }
    }

    /// Validate and fix configuration inconsistencies
    pub fn validate_and_fix(&mut self) {
        if self.relay.ping_interval_secs == 0 {
            tracing::warn!("relay.ping_interval_secs must be at least 1, using 1");
            self.relay.ping_interval_secs = 1;
        }

        if self.relay.chair_device_id == self.relay.camera_device_id {
            // The classifier checks the chair id first, so the camera role becomes unreachable
            tracing::warn!(
                "relay.chair_device_id and relay.camera_device_id are both {:?}; camera frames will be treated as chair frames",
                self.relay.chair_device_id
            );
        }
    }
}

// set server.enabled = false to run without a listener (useful for dry-running the config)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_server_host")]
    pub host: String,
    /// Value announced to every peer in the `server_role` handshake event
    #[serde(default = "default_server_role")]
    pub role: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            port: default_server_port(),
            host: default_server_host(),
            role: default_server_role(),
        }
    }
}

fn default_server_enabled() -> bool {
    true
}

fn default_server_port() -> u16 {
    3000
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

fn default_server_role() -> String {
    "relay".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Seconds between heartbeat pings. A peer that misses one is dropped on the next tick.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_chair_device_id")]
    pub chair_device_id: String,
    #[serde(default = "default_camera_device_id")]
    pub camera_device_id: String,
    /// `type` value marking an observer frame as a command for the camera
    #[serde(default = "default_control_type")]
    pub control_type: String,
}

impl RelayConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            chair_device_id: default_chair_device_id(),
            camera_device_id: default_camera_device_id(),
            control_type: default_control_type(),
        }
    }
}

fn default_ping_interval_secs() -> u64 {
    25
}

fn default_chair_device_id() -> String {
    "chair_01".to_string()
}

fn default_camera_device_id() -> String {
    "camera_01".to_string()
}

fn default_control_type() -> String {
    "camera_control".to_string()
}
