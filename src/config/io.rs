//! Configuration I/O - Loading configuration
//!
//! Handles reading configuration from files and environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use super::types::Config;
use crate::error::{Error, Result};

/// Load configuration with layered precedence:
/// 1. Config file if it exists, otherwise defaults
/// 2. Environment variable overrides (includes .env)
pub fn load_config() -> Result<Config> {
    let config_path = super::paths::config_path();

    let mut config = if config_path.exists() {
        load_config_from_path(&config_path)?
    } else {
        Config::default()
    };

    apply_env_overrides(&mut config)?;

    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;

    parse_config(path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<Config> {
    // Detect format by extension
    let config: Config = if path.extension().is_some_and(|ext| ext == "json") {
        json5::from_str(content).map_err(|e| Error::Config(format!("Invalid JSON config: {}", e)))?
    } else if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(content).map_err(|e| Error::Config(format!("Invalid TOML config: {}", e)))?
    } else {
        // Try JSON5 first, then TOML
        json5::from_str(content)
            .or_else(|_| toml::from_str(content).map_err(|e| Error::Config(e.to_string())))
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?
    };

    Ok(config)
}

/// Apply environment variable overrides to an existing config.
///
/// Loads `.env` if present, then overlays any set variables. Env vars have
/// the highest precedence: defaults < file < env.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    dotenvy::dotenv().ok();
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides<F>(config: &mut Config, var: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = var("JAILRUN_NSJAIL") {
        config.sandbox.nsjail_path = PathBuf::from(path);
    }
    if let Some(path) = var("JAILRUN_INTERPRETER") {
        config.sandbox.interpreter = PathBuf::from(path);
    }
    if let Some(dir) = var("JAILRUN_WORK_DIR") {
        config.sandbox.work_dir = PathBuf::from(dir);
    }
    if let Some(bytes) = var("JAILRUN_MAX_SCRIPT_BYTES") {
        config.sandbox.max_script_bytes = parse_var("JAILRUN_MAX_SCRIPT_BYTES", &bytes)?;
    }
    if let Some(timeout) = var("JAILRUN_ATTEMPT_TIMEOUT") {
        config.sandbox.attempt_timeout = parse_duration("JAILRUN_ATTEMPT_TIMEOUT", &timeout)?;
    }
    if let Some(timeout) = var("JAILRUN_SUBMISSION_TIMEOUT") {
        config.sandbox.submission_timeout =
            parse_duration("JAILRUN_SUBMISSION_TIMEOUT", &timeout)?;
    }
    if let Some(secs) = var("JAILRUN_TIME_LIMIT") {
        config.sandbox.time_limit_secs = parse_var("JAILRUN_TIME_LIMIT", &secs)?;
    }
    if let Some(flag) = var("JAILRUN_ALLOW_DIRECT") {
        config.sandbox.allow_direct_fallback = parse_bool(&flag);
    }
    if let Some(bind) = var("JAILRUN_BIND") {
        config.server.bind = bind;
    }
    if let Some(port) = var("JAILRUN_PORT") {
        config.server.port = parse_var("JAILRUN_PORT", &port)?;
    }
    if let Some(level) = var("RUST_LOG") {
        config.log.level = level;
    }
    if let Some(format) = var("LOG_FORMAT") {
        config.log.format = format;
    }
    Ok(())
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("Invalid value for {}: {} ({})", key, value, e)))
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    // Bare numbers are seconds
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value.trim())
        .map_err(|e| Error::Config(format!("Invalid value for {}: {} ({})", key, value, e)))
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Render a sample configuration file
pub fn sample_config() -> Result<String> {
    Ok(serde_json::to_string_pretty(&Config::default())?)
}
