// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads the TOML file, deserializes it into `RawConfig`, and converts the
//! raw session and provider entries into a typed `Config`.

use log::Level;
use std::{fs, path::Path};

use super::model::{Config, ConfigError, RawConfig, SessionConfig};

/// Load and parse the configuration from `path`.
/// Logs at DEBUG before reading and INFO on success.
pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    etw_log!(Level::Debug, "config", "reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let cfg = parse(&txt)?;
    etw_log!(
        Level::Info,
        "config",
        "loaded config from {:?}: session '{}', {} provider(s)",
        path,
        cfg.session.name,
        cfg.providers.len()
    );
    Ok(cfg)
}

/// Parse configuration text.
pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(text)?;

    let providers = raw
        .providers
        .into_iter()
        .enumerate()
        .map(|(i, p)| p.into_typed(i + 1))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Config {
        session: SessionConfig::try_from(raw.session)?,
        logging: raw.logging,
        providers,
    })
}
