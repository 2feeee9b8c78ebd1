/// Configuration for the Herald notification engine.
/// Handles loading, parsing, and validation of the engine's TOML config.
use crate::errors::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Locale resolution settings
    #[serde(default)]
    pub localization: LocalizationConfig,

    /// Dispatcher fan-out and retry settings
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// In-application inbox settings
    #[serde(default)]
    pub inbox: InboxConfig,

    /// Template lookup settings
    #[serde(default)]
    pub templates: TemplatesConfig,

    /// Realtime broadcast settings
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

/// Locale resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalizationConfig {
    /// Locale used when neither the caller nor the event supplies one
    #[serde(default = "default_locale")]
    pub default_locale: String,
}

fn default_locale() -> String {
    "en".to_string()
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            default_locale: default_locale(),
        }
    }
}

/// Dispatcher fan-out and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Whether dispatching is enabled at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Max delivery attempts per adapter candidate
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Max concurrent delivery workers per dispatch call
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Recipients/tenants allowed to fall back to ambient (environment)
    /// credentials when no stored secret resolves
    #[serde(default)]
    pub env_fallback_allowlist: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_workers() -> usize {
    4
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_retries: default_max_retries(),
            max_workers: default_max_workers(),
            env_fallback_allowlist: Vec::new(),
        }
    }
}

/// In-application inbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
        }
    }
}

/// Template lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesConfig {
    /// Variant cache TTL in seconds; 0 disables the cache
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

fn default_cache_ttl_secs() -> u64 {
    60
}

impl TemplatesConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

/// Realtime broadcast settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RealtimeConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl EngineConfig {
    /// Parse a TOML document into a validated config.
    pub fn from_toml_str(raw: &str) -> DispatchResult<Self> {
        let config: EngineConfig = toml::from_str(raw)
            .map_err(|e| DispatchError::ConfigError(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file from disk.
    pub fn load_from_path(path: &Path) -> DispatchResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    /// Reject out-of-range values before anything consumes the config.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.localization.default_locale.trim().is_empty() {
            return Err(DispatchError::ConfigError(
                "localization.default_locale must be non-empty".to_string(),
            ));
        }
        if self.dispatcher.max_workers == 0 {
            return Err(DispatchError::ConfigError(
                "dispatcher.max_workers must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.localization.default_locale, "en");
        assert!(config.dispatcher.enabled);
        assert_eq!(config.dispatcher.max_retries, 3);
        assert_eq!(config.dispatcher.max_workers, 4);
        assert!(config.dispatcher.env_fallback_allowlist.is_empty());
        assert!(config.inbox.enabled);
        assert_eq!(config.templates.cache_ttl(), Duration::from_secs(60));
        assert!(!config.realtime.enabled);
    }

    #[test]
    fn toml_round_trip() {
        let raw = r#"
            [localization]
            default_locale = "pt-BR"

            [dispatcher]
            max_retries = 2
            max_workers = 8
            env_fallback_allowlist = ["ops@example.com"]

            [templates]
            cache_ttl_secs = 0

            [realtime]
            enabled = true
        "#;
        let config = EngineConfig::from_toml_str(raw).expect("valid config");
        assert_eq!(config.localization.default_locale, "pt-BR");
        assert_eq!(config.dispatcher.max_retries, 2);
        assert_eq!(config.dispatcher.max_workers, 8);
        assert_eq!(
            config.dispatcher.env_fallback_allowlist,
            vec!["ops@example.com"]
        );
        assert_eq!(config.templates.cache_ttl_secs, 0);
        assert!(config.realtime.enabled);
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.toml");
        std::fs::write(&path, "[localization]\ndefault_locale = \"de\"\n").unwrap();
        let config = EngineConfig::load_from_path(&path).unwrap();
        assert_eq!(config.localization.default_locale, "de");
        assert!(EngineConfig::load_from_path(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let raw = r#"
            [dispatcher]
            max_workers = 0
        "#;
        assert!(EngineConfig::from_toml_str(raw).is_err());

        let raw = r#"
            [localization]
            default_locale = "  "
        "#;
        assert!(EngineConfig::from_toml_str(raw).is_err());
    }
}
