use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the recording sync service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Remote recorder (Shinobi) configuration
    pub recorder: RecorderConfig,
    /// Local storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Event correlation configuration
    #[serde(default)]
    pub correlation: CorrelationConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Remote recorder connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecorderConfig {
    /// Base URL of the recorder, e.g. "http://shinobi:8080"
    pub base_url: String,
    /// API key used as the first path segment
    pub api_key: String,
    /// Group key owning the monitors
    pub group_key: String,
    /// Timeout for catalog and control requests in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Timeout for a single recording download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

/// Local storage layout and background loop timing
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root of the expiring recording tree: {temp_dir}/{camera_id}/{filename}
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Root of the durable tree: {permanent_dir}/{camera_id}/{YYYYMMDD_HHMMSS}/{filename}
    #[serde(default = "default_permanent_dir")]
    pub permanent_dir: PathBuf,
    /// Age after which non-permanent recordings are deleted, in seconds
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Interval between sync cycles in seconds
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    /// Interval between reaper cycles in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Upper bound for a local copy or delete in seconds
    #[serde(default = "default_file_op_timeout_secs")]
    pub file_op_timeout_secs: u64,
}

/// Event window configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CorrelationConfig {
    /// Seconds before the event that still belong to it
    #[serde(default = "default_pre_event_secs")]
    pub pre_event_secs: u64,
    /// Seconds after the event that still belong to it
    #[serde(default = "default_post_event_secs")]
    pub post_event_secs: u64,
    /// Promote recordings downloaded this many seconds before an event even
    /// when their recording time misses the window (0 = disabled)
    #[serde(default = "default_recent_fallback_secs")]
    pub recent_fallback_secs: u64,
    /// Also mark the event on the remote recorder
    #[serde(default)]
    pub forward_to_recorder: bool,
}

/// API configuration for the event and stats endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "recording-sync".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_download_timeout_secs() -> u64 {
    60
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp_recordings")
}

fn default_permanent_dir() -> PathBuf {
    PathBuf::from("./permanent_recordings")
}

fn default_retention_secs() -> u64 {
    3600 // 1 hour
}

fn default_sync_interval_secs() -> u64 {
    30
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_file_op_timeout_secs() -> u64 {
    120
}

fn default_pre_event_secs() -> u64 {
    60
}

fn default_post_event_secs() -> u64 {
    60
}

fn default_recent_fallback_secs() -> u64 {
    300 // 5 minutes
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "recording-sync")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/recording-sync").required(false))
            .add_source(config::File::with_name("/etc/recording-sync/config").required(false))
            // RECSYNC__STORAGE__TEMP_DIR -> storage.temp_dir
            .add_source(
                config::Environment::with_prefix("RECSYNC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let url = &self.recorder.base_url;
        if url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "recorder.base_url".to_string(),
            ));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "recorder.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }
        if self.recorder.api_key.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "recorder.api_key".to_string(),
            ));
        }
        if self.recorder.group_key.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "recorder.group_key".to_string(),
            ));
        }

        self.storage.validate()?;

        if self.recorder.request_timeout_secs == 0 || self.recorder.download_timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "recorder.*_timeout_secs".to_string(),
                message: "Timeouts must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl StorageConfig {
    /// Validate directory layout and loop timing.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.temp_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.temp_dir".to_string(),
            ));
        }
        if self.permanent_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.permanent_dir".to_string(),
            ));
        }
        if self.temp_dir == self.permanent_dir {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage.permanent_dir".to_string(),
                message: "Must differ from storage.temp_dir".to_string(),
            });
        }
        if self.retention_secs == 0
            || self.sync_interval_secs == 0
            || self.cleanup_interval_secs == 0
            || self.file_op_timeout_secs == 0
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "storage".to_string(),
                message: "Retention, intervals and timeouts must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Get retention horizon as Duration
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Get sync interval as Duration
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    /// Get cleanup interval as Duration
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Get local file operation timeout as Duration
    pub fn file_op_timeout(&self) -> Duration {
        Duration::from_secs(self.file_op_timeout_secs)
    }
}

impl RecorderConfig {
    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get download timeout as Duration
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            permanent_dir: default_permanent_dir(),
            retention_secs: default_retention_secs(),
            sync_interval_secs: default_sync_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            file_op_timeout_secs: default_file_op_timeout_secs(),
        }
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            pre_event_secs: default_pre_event_secs(),
            post_event_secs: default_post_event_secs(),
            recent_fallback_secs: default_recent_fallback_secs(),
            forward_to_recorder: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            recorder: RecorderConfig {
                base_url: "http://shinobi:8080".to_string(),
                api_key: "key".to_string(),
                group_key: "group".to_string(),
                request_timeout_secs: 30,
                download_timeout_secs: 60,
            },
            storage: StorageConfig::default(),
            correlation: CorrelationConfig::default(),
            api: ApiConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_retention_secs(), 3600);
        assert_eq!(default_pre_event_secs(), 60);
        assert_eq!(default_post_event_secs(), 60);
        assert_eq!(default_recent_fallback_secs(), 300);
    }

    #[test]
    fn test_valid_config() {
        assert!(create_test_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_base_url() {
        let mut config = create_test_config();
        config.recorder.base_url = "rtsp://shinobi".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_same_temp_and_permanent_dir() {
        let mut config = create_test_config();
        config.storage.permanent_dir = config.storage.temp_dir.clone();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_retention_rejected() {
        let mut config = create_test_config();
        config.storage.retention_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_group_key() {
        let mut config = create_test_config();
        config.recorder.group_key = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }
}
