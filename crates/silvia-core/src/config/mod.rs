//! Configuration management with file persistence
//!
//! Settings live in `config.toml` under the platform config directory
//! (override with `SILVIA_CONFIG_DIR`). The API key is never stored in the
//! file; it comes from the environment only.

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

/// Silvia configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root of the on-disk knowledge graph
    pub data_dir: PathBuf,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    /// Model used for refinement and general completions
    pub default_model: String,
    /// Model used for entity merging, where link preservation matters most
    pub merge_model: String,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            llm: LlmConfig {
                api_key: None,
                default_model: "anthropic/claude-3.5-sonnet".to_string(),
                merge_model: "anthropic/claude-3.5-sonnet".to_string(),
                timeout_secs: 120,
            },
        }
    }
}

fn default_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("SILVIA_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("silvia")
}

impl LlmConfig {
    /// API key from the environment; never read from the config file
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("SILVIA_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok())
    }

    /// API key with all but the last four characters masked
    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key().map(|opt| {
            opt.map(|key| {
                if key.len() <= 4 {
                    "***".to_string()
                } else {
                    format!("***{}", &key[key.len() - 4..])
                }
            })
        })
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "LLM API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("SILVIA_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("silvia")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or defaults if no file exists.
    ///
    /// `SILVIA_DATA_DIR` overrides the data directory regardless of what the
    /// file says.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            config
        } else {
            Config::default()
        };

        if let Ok(dir) = env::var("SILVIA_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.enforce_env_only()
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "data_dir" => Ok(self.data_dir.display().to_string()),

            "llm.default_model" => Ok(self.llm.default_model.clone()),
            "llm.merge_model" => Ok(self.llm.merge_model.clone()),
            "llm.timeout_secs" => Ok(self.llm.timeout_secs.to_string()),

            // API key is shown redacted, never stored
            "llm.api_key" | "api_key" => match self.llm.redacted_api_key()? {
                Some(redacted) => Ok(redacted),
                None => Ok(
                    "(not set - use SILVIA_API_KEY or OPENROUTER_API_KEY env var)".to_string(),
                ),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `silvia config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "data_dir" => {
                self.data_dir = PathBuf::from(value);
            }
            "llm.default_model" => {
                self.llm.default_model = value.to_string();
            }
            "llm.merge_model" => {
                self.llm.merge_model = value.to_string();
            }
            "llm.timeout_secs" => {
                let secs: u64 = value
                    .parse()
                    .with_context(|| format!("Invalid timeout value: {}", value))?;
                if secs == 0 {
                    return Err(anyhow!("Timeout must be at least 1 second"));
                }
                self.llm.timeout_secs = secs;
            }
            "llm.api_key" | "api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration. Set the SILVIA_API_KEY or OPENROUTER_API_KEY environment variable instead."
                ));
            }
            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `silvia config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// All settable keys with their current values
    pub fn list(&self) -> Vec<(&'static str, String)> {
        vec![
            ("data_dir", self.data_dir.display().to_string()),
            ("llm.default_model", self.llm.default_model.clone()),
            ("llm.merge_model", self.llm.merge_model.clone()),
            ("llm.timeout_secs", self.llm.timeout_secs.to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_is_never_stored() {
        let mut config = Config::default();
        assert!(config.set("llm.api_key", "sk-secret").is_err());

        config.llm.api_key = Some("sk-secret".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_set_and_get_round_trip() {
        let mut config = Config::default();
        config.set("llm.default_model", "openai/gpt-4o").unwrap();
        assert_eq!(config.get("llm.default_model").unwrap(), "openai/gpt-4o");

        assert!(config.set("llm.timeout_secs", "0").is_err());
        assert!(config.set("nonexistent.key", "x").is_err());
    }

    #[test]
    fn test_list_covers_settable_keys() {
        let config = Config::default();
        let keys: Vec<_> = config.list().into_iter().map(|(k, _)| k).collect();
        assert!(keys.contains(&"data_dir"));
        assert!(keys.contains(&"llm.merge_model"));
    }
}
