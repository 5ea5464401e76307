//! Study settings with environment overrides.

use std::str::FromStr;

use kioku_core::validation::DEFAULT_BYPASS_TOKEN;
use thiserror::Error;

pub const DEFAULT_BATCH_SIZE: u32 = 5;
pub const DEFAULT_DAILY_BATCH_LIMIT: u32 = 10;
pub const DEFAULT_PERSIST_ATTEMPTS: u32 = 2;

pub const ENV_BATCH_SIZE: &str = "KIOKU_BATCH_SIZE";
pub const ENV_DAILY_BATCH_LIMIT: &str = "KIOKU_DAILY_BATCH_LIMIT";
pub const ENV_REVIEW_LIMIT: &str = "KIOKU_REVIEW_LIMIT";
pub const ENV_BYPASS_TOKEN: &str = "KIOKU_BYPASS_TOKEN";
pub const ENV_SEED: &str = "KIOKU_SEED";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{key} has an invalid value: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("{key} must be at least 1")]
    Zero { key: &'static str },
}

/// Knobs for session building and persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StudySettings {
    /// Units per discovery batch.
    pub batch_size: u32,
    /// Discovery batches a user may start per UTC day.
    pub daily_batch_limit: u32,
    /// Upper bound on review session length; `None` means every due facet.
    pub review_limit: Option<u32>,
    /// Tries per scheduling write before it is parked as pending.
    pub persist_attempts: u32,
    /// Input accepted as correct for automation. `None` disables it.
    pub bypass_token: Option<String>,
    /// Seed for cloze example selection.
    pub seed: Option<u64>,
}

impl Default for StudySettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            daily_batch_limit: DEFAULT_DAILY_BATCH_LIMIT,
            review_limit: None,
            persist_attempts: DEFAULT_PERSIST_ATTEMPTS,
            bypass_token: Some(DEFAULT_BYPASS_TOKEN.to_owned()),
            seed: None,
        }
    }
}

impl StudySettings {
    /// Defaults overridden by the `KIOKU_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading values through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a value cannot be parsed.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        if let Some(size) = parse_var(&lookup, ENV_BATCH_SIZE)? {
            settings.batch_size = non_zero(ENV_BATCH_SIZE, size)?;
        }
        if let Some(limit) = parse_var(&lookup, ENV_DAILY_BATCH_LIMIT)? {
            settings.daily_batch_limit = limit;
        }
        if let Some(limit) = parse_var(&lookup, ENV_REVIEW_LIMIT)? {
            settings.review_limit = Some(non_zero(ENV_REVIEW_LIMIT, limit)?);
        }
        if let Some(token) = lookup(ENV_BYPASS_TOKEN) {
            let token = token.trim();
            settings.bypass_token = (!token.is_empty()).then(|| token.to_owned());
        }
        settings.seed = parse_var(&lookup, ENV_SEED)?;
        Ok(settings)
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    #[must_use]
    pub fn without_bypass(mut self) -> Self {
        self.bypass_token = None;
        self
    }

    #[must_use]
    pub fn bypass(&self) -> Option<&str> {
        self.bypass_token.as_deref()
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key,
            value: trimmed.to_owned(),
        })
}

fn non_zero(key: &'static str, value: u32) -> Result<u32, ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { key })
    } else {
        Ok(value)
    }
}
