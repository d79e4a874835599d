// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads a TOML file (or string), deserializes it into [`Config`] and
//! validates the engine settings.

use crate::selftarget_log;
use crate::config::model::{Config, ConfigError};
use log::Level;
use std::{fs, path::Path};

/// Load and parse the configuration from `path`.
/// Logs at DEBUG before reading and INFO on success.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    selftarget_log!(Level::Debug, "config", "Reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let cfg = parse(&txt)?;
    selftarget_log!(Level::Info, "config", "Loaded config from {:?}", path);
    Ok(cfg)
}

/// Parse and validate configuration text.
pub fn parse(txt: &str) -> Result<Config, ConfigError> {
    let cfg: Config = toml::from_str(txt)?;
    cfg.validate()?;
    Ok(cfg)
}
