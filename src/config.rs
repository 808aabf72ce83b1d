use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_FLUSH_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY (or API_KEY) is not set")]
    MissingApiKey,

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    /// Period of the typewriter flush timer.
    pub flush_interval: Duration,
    pub data_dir: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_key = lookup("GEMINI_API_KEY")
            .or_else(|| lookup("API_KEY"))
            .filter(|key| !key.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let flush_interval = match lookup("QANUN_FLUSH_MS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "QANUN_FLUSH_MS",
                        value: raw,
                    });
                }
            },
            None => Duration::from_millis(DEFAULT_FLUSH_MS),
        };

        Ok(Self {
            api_key,
            model: lookup("QANUN_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_base: lookup("QANUN_API_BASE")
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            flush_interval,
            data_dir: lookup("QANUN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(crate::storage::default_data_dir),
        })
    }
}
