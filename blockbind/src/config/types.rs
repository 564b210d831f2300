use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid value: {0}")]
    Invalid(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e.to_string())
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Engine-wide defaults applied when blocks are mounted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Page size for data blocks that do not configure one.
    pub default_page_size: u32,
    /// Page size for filter-type table blocks.
    pub filter_page_size: u32,
    /// Row key used when neither the block nor the collection declares one.
    pub default_row_key: String,
    /// Publish successful results into the page service cache.
    pub publish_results: bool,
    /// Remote resource endpoint. Absent means the in-memory client.
    pub http: Option<HttpClientConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            filter_page_size: 10,
            default_row_key: "id".to_string(),
            publish_results: true,
            http: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// Base URL of the resource API, e.g. `http://localhost:13000/api`
    pub base_url: String,
    /// Bearer token sent with every request.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_page_size == 0 {
            return Err(ConfigError::Invalid("default_page_size must be > 0".into()));
        }
        if self.filter_page_size == 0 {
            return Err(ConfigError::Invalid("filter_page_size must be > 0".into()));
        }
        if self.default_row_key.trim().is_empty() {
            return Err(ConfigError::Invalid("default_row_key must not be empty".into()));
        }
        if let Some(http) = &self.http {
            if http.base_url.trim().is_empty() {
                return Err(ConfigError::Invalid("http.base_url must not be empty".into()));
            }
        }
        Ok(())
    }
}
