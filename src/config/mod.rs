//! Configuration module for mlserve.

use crate::error::{Result, ServeError};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for a serving node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServeConfig {
    /// Node configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Artifact storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Monitoring configuration.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ServeConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ServeError::Config(format!("Failed to read config file: {}", e))
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|e| {
            ServeError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.registry.default_version.trim().is_empty() {
            return Err(ServeError::InvalidConfig {
                field: "registry.default_version".to_string(),
                reason: "Default version must be non-empty".to_string(),
            });
        }

        if self.registry.max_batch_size == 0 {
            return Err(ServeError::InvalidConfig {
                field: "registry.max_batch_size".to_string(),
                reason: "Batch size limit must be non-zero".to_string(),
            });
        }

        if self.monitor.history_capacity == 0 {
            return Err(ServeError::InvalidConfig {
                field: "monitor.history_capacity".to_string(),
                reason: "History capacity must be non-zero".to_string(),
            });
        }

        if self.monitor.throughput_window.is_zero() {
            return Err(ServeError::InvalidConfig {
                field: "monitor.throughput_window".to_string(),
                reason: "Throughput window must be non-zero".to_string(),
            });
        }

        if !(self.monitor.drift_threshold > 0.0) {
            return Err(ServeError::InvalidConfig {
                field: "monitor.drift_threshold".to_string(),
                reason: "Drift threshold must be positive".to_string(),
            });
        }

        if self.monitor.drift_window == 0 {
            return Err(ServeError::InvalidConfig {
                field: "monitor.drift_window".to_string(),
                reason: "Drift window must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Create a minimal development configuration.
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                name: "mlserve-dev".to_string(),
                environment: "development".to_string(),
            },
            storage: StorageConfig {
                model_dir: PathBuf::from("./models"),
            },
            registry: RegistryConfig::default(),
            monitor: MonitorConfig::default(),
            observability: ObservabilityConfig {
                metrics_enabled: true,
                metrics_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
                log_level: "debug".to_string(),
                json_logs: false,
            },
        }
    }
}

/// Node-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Human-readable node name.
    pub name: String,
    /// Deployment environment label.
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "mlserve".to_string(),
            environment: "production".to_string(),
        }
    }
}

/// Artifact storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per model version.
    pub model_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models"),
        }
    }
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Version used when a request names none.
    pub default_version: String,
    /// Maximum rows accepted in one prediction request.
    pub max_batch_size: usize,
    /// Advisory timeout for loading one model; enforced by the caller.
    #[serde(with = "humantime_serde")]
    pub load_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_version: "v1".to_string(),
            max_batch_size: 100,
            load_timeout: Duration::from_secs(30),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Records retained per version, for predictions and errors separately.
    pub history_capacity: usize,
    /// Age beyond which throughput samples are purged.
    #[serde(with = "humantime_serde")]
    pub throughput_window: Duration,
    /// Number of errors reported in stats.
    pub recent_errors: usize,
    /// Coefficient of variation above which a feature is flagged as drifting.
    pub drift_threshold: f64,
    /// Default number of recent predictions examined by a drift check.
    pub drift_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            throughput_window: Duration::from_secs(60),
            recent_errors: 10,
            drift_threshold: 0.1,
            drift_window: 100,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics.
    pub metrics_enabled: bool,
    /// Metrics bind address.
    pub metrics_addr: SocketAddr,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for Duration using humantime format.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}ms", duration.as_millis()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        } else if let Some(s_val) = s.strip_suffix('s') {
            s_val
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| e.to_string())
        } else if let Some(m) = s.strip_suffix('m') {
            m.parse::<u64>()
                .map(|v| Duration::from_secs(v * 60))
                .map_err(|e| e.to_string())
        } else {
            s.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| e.to_string())
        }
    }
}
