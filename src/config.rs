// Engine Configuration
//
// Defines configuration for the clustering and verification jobs: batch
// bounds, capability timeouts, scheduling intervals and LLM settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for crate::error::EngineError {
    fn from(err: ConfigError) -> Self {
        crate::error::EngineError::Config(err.to_string())
    }
}

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub clustering: ClusteringConfig,

    #[serde(default)]
    pub verification: VerificationSettings,

    #[serde(default)]
    pub llm: LlmSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libsql database file
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("triage-loop")
                .join("triage.db"),
        }
    }
}

/// Clustering job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Units with fewer eligible records are skipped as insufficient data
    pub min_cluster_size: usize,

    /// Maximum number of records sent to the clustering capability
    pub max_reviews: usize,

    /// Maximum characters of feedback text sent per record
    pub snippet_chars: usize,

    /// Timeout for one clustering capability call (in seconds)
    #[serde(with = "serde_duration")]
    pub capability_timeout: Duration,

    /// Scopes clustered for every app by the batch job ("all" or a category)
    pub scopes: Vec<String>,

    /// Interval between scheduled batch runs (in seconds)
    #[serde(with = "serde_duration")]
    pub interval: Duration,

    /// Maximum duration of one scheduled batch run (in seconds)
    #[serde(with = "serde_duration")]
    pub max_duration: Duration,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            max_reviews: 300,
            snippet_chars: 200,
            capability_timeout: Duration::from_secs(120),
            scopes: vec!["all".to_string()],
            interval: Duration::from_secs(86400),    // 24 hours
            max_duration: Duration::from_secs(1800), // 30 minutes
        }
    }
}

/// Verification job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    /// Length of the baseline window for quick-mode configs (in days)
    pub quick_baseline_days: i64,

    #[serde(with = "serde_duration")]
    pub interval: Duration,

    #[serde(with = "serde_duration")]
    pub max_duration: Duration,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            quick_baseline_days: 14,
            interval: Duration::from_secs(86400),   // 24 hours
            max_duration: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// LLM settings; the API key is read from the environment, never from file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 8192,
            temperature: 0.2,
        }
    }
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let clustering = &self.clustering;

        if clustering.min_cluster_size == 0 {
            return Err(ConfigError::ValidationError(
                "clustering: min_cluster_size must be at least 1".to_string(),
            ));
        }

        if clustering.max_reviews < clustering.min_cluster_size || clustering.max_reviews > 10000 {
            return Err(ConfigError::ValidationError(
                "clustering: max_reviews must be between min_cluster_size and 10000".to_string(),
            ));
        }

        if clustering.snippet_chars == 0 {
            return Err(ConfigError::ValidationError(
                "clustering: snippet_chars must be positive".to_string(),
            ));
        }

        if clustering.capability_timeout < Duration::from_secs(1)
            || clustering.capability_timeout > Duration::from_secs(1800)
        {
            return Err(ConfigError::ValidationError(
                "clustering: capability_timeout must be between 1 second and 30 minutes"
                    .to_string(),
            ));
        }

        if clustering.scopes.is_empty() || clustering.scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "clustering: scopes must be a non-empty list of non-empty names".to_string(),
            ));
        }

        self.validate_schedule("clustering", clustering.interval, clustering.max_duration)?;
        self.validate_schedule(
            "verification",
            self.verification.interval,
            self.verification.max_duration,
        )?;

        if self.verification.quick_baseline_days < 1 || self.verification.quick_baseline_days > 365 {
            return Err(ConfigError::ValidationError(
                "verification: quick_baseline_days must be between 1 and 365".to_string(),
            ));
        }

        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "llm: model must be set".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_schedule(
        &self,
        name: &str,
        interval: Duration,
        max_duration: Duration,
    ) -> Result<(), ConfigError> {
        // Interval must be at least 1 hour
        if interval < Duration::from_secs(3600) {
            return Err(ConfigError::ValidationError(format!(
                "{}: interval must be at least 1 hour",
                name
            )));
        }

        if max_duration < Duration::from_secs(60) || max_duration > interval {
            return Err(ConfigError::ValidationError(format!(
                "{}: max_duration must be at least 1 minute and no longer than interval",
                name
            )));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.clustering.min_cluster_size, 3);
        assert_eq!(config.clustering.max_reviews, 300);
        assert_eq!(config.verification.quick_baseline_days, 14);
    }

    #[test]
    fn test_validate_min_cluster_size_zero() {
        let mut config = EngineConfig::default();
        config.clustering.min_cluster_size = 0;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("min_cluster_size must be at least 1"));
    }

    #[test]
    fn test_validate_interval_too_short() {
        let mut config = EngineConfig::default();
        config.verification.interval = Duration::from_secs(60);

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("interval must be at least 1 hour"));
    }

    #[test]
    fn test_validate_empty_scopes() {
        let mut config = EngineConfig::default();
        config.clustering.scopes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_partial_uses_defaults() {
        let toml_str = r#"
            [database]
            path = "/tmp/triage.db"

            [clustering]
            min_cluster_size = 5
            capability_timeout = 60
            scopes = ["all", "Tech_Bug"]

            [llm]
            model = "claude-3-5-sonnet-20241022"
        "#;

        let config = EngineConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/triage.db"));
        assert_eq!(config.clustering.min_cluster_size, 5);
        assert_eq!(config.clustering.max_reviews, 300);
        assert_eq!(config.clustering.capability_timeout, Duration::from_secs(60));
        assert_eq!(config.clustering.scopes.len(), 2);
        assert_eq!(config.verification.quick_baseline_days, 14);
        assert_eq!(config.llm.max_tokens, 8192);
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: EngineConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(
            config.clustering.max_reviews,
            deserialized.clustering.max_reviews
        );
        assert_eq!(
            config.clustering.capability_timeout,
            deserialized.clustering.capability_timeout
        );
    }
}
