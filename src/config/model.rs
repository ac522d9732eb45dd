// src/config/model.rs

use serde::Deserialize;
use std::{str::FromStr, time::Duration};
use thiserror::Error;

use crate::etw::{DEFAULT_JOIN_TIMEOUT, Guid, TraceLevel};

/// Top-level runtime config
#[derive(Debug, Clone)]
pub struct Config {
    pub session: SessionConfig,
    pub logging: LoggingConfig,
    pub providers: Vec<ProviderConfig>,
}

/// Fully-typed `[session]` table
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub mode: RunMode,
    /// Stop automatically after this long.
    pub duration: Option<Duration>,
    pub join_timeout: Duration,
}

/// Which thread runs the delivery loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// `Trace::run` on the main thread.
    #[default]
    Blocking,
    /// `Trace::run_async` on a worker; main thread waits for the end.
    Background,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]            pub enable: bool,
    #[serde(default)]            pub file:   Option<String>,
    #[serde(default = "default_level")] pub level: String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// One `[[providers]]` entry, typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub selector: ProviderSelector,
    pub level: TraceLevel,
    pub keywords: u64,
    /// Empty means every event of the provider.
    pub event_ids: Vec<u16>,
}

/// How a provider is named in the config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSelector {
    Guid(Guid),
    Name(String),
}

// ---------------------------------------------------------------------------
// raw TOML shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub session: RawSession,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub providers: Vec<RawProvider>,
}

/// Mirror of the `[session]` table; only `name` is required
#[derive(Debug, Deserialize)]
pub struct RawSession {
    pub name: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub join_timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawProvider {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub keywords: Option<RawKeywords>,
    #[serde(default)]
    pub events: Vec<u16>,
}

/// `keywords = 112` or `keywords = "0x70"`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawKeywords {
    Number(u64),
    Text(String),
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid trace level '{0}'")]
    InvalidLevel(String),

    #[error("invalid provider GUID '{0}': {1}")]
    InvalidGuid(String, #[source] crate::etw::GuidParseError),

    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("invalid keyword mask '{0}'")]
    InvalidKeywords(String),

    #[error("invalid run mode '{0}' (expected blocking or background)")]
    InvalidMode(String),

    #[error("provider #{0} has neither name nor guid")]
    MissingProvider(usize),

    #[error("provider #{0} has both name and guid")]
    AmbiguousProvider(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Allow `"background"` → `RunMode::Background`
impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blocking"   => Ok(RunMode::Blocking),
            "background" => Ok(RunMode::Background),
            other        => Err(ConfigError::InvalidMode(other.into())),
        }
    }
}

impl RawKeywords {
    pub fn to_mask(&self) -> Result<u64, ConfigError> {
        match self {
            RawKeywords::Number(n) => Ok(*n),
            RawKeywords::Text(text) => {
                let t = text.trim();
                let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => t.parse(),
                };
                parsed.map_err(|_| ConfigError::InvalidKeywords(text.clone()))
            }
        }
    }
}

pub(crate) fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(text).map_err(|e| ConfigError::InvalidDuration(text.into(), e))
}

impl TryFrom<RawSession> for SessionConfig {
    type Error = ConfigError;

    fn try_from(raw: RawSession) -> Result<Self, Self::Error> {
        Ok(SessionConfig {
            mode: raw.mode.as_deref().map(str::parse::<RunMode>).transpose()?.unwrap_or_default(),
            duration: raw.duration.as_deref().map(parse_duration).transpose()?,
            join_timeout: raw
                .join_timeout
                .as_deref()
                .map(parse_duration)
                .transpose()?
                .unwrap_or(DEFAULT_JOIN_TIMEOUT),
            name: raw.name,
        })
    }
}

impl RawProvider {
    /// `position` is the 1-based entry number, used in error messages.
    pub fn into_typed(self, position: usize) -> Result<ProviderConfig, ConfigError> {
        let selector = match (self.name, self.guid) {
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousProvider(position)),
            (None, None) => return Err(ConfigError::MissingProvider(position)),
            (Some(name), None) => ProviderSelector::Name(name),
            (None, Some(text)) => ProviderSelector::Guid(
                text.parse().map_err(|e| ConfigError::InvalidGuid(text.clone(), e))?,
            ),
        };

        let level = match self.level {
            Some(text) => text.parse::<TraceLevel>().map_err(|_| ConfigError::InvalidLevel(text))?,
            None => TraceLevel::default(),
        };

        Ok(ProviderConfig {
            selector,
            level,
            keywords: self.keywords.map(|k| k.to_mask()).transpose()?.unwrap_or(crate::etw::ALL_KEYWORDS),
            event_ids: self.events,
        })
    }
}
