use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::workers::PipelineConfig;

const DEFAULT_SDK_URL: &str = "https://sdk.split.io/api";
const DEFAULT_EVENTS_URL: &str = "https://events.split.io/api";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compression {
    Gzip,
    None,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not a valid URL: {1}")]
    InvalidUrl(String, String),

    #[error("{0} has invalid value: {1}")]
    InvalidNumeric(String, String),

    #[error("{0} must be greater than zero")]
    MustBePositive(String),

    #[error("SPLIT_RELAY_COMPRESSION has invalid value: {0} (expected \"gzip\" or \"none\")")]
    InvalidCompression(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SDK-facing API base (split and segment changes). Validated and logged
    /// at startup; the impressions path only posts to `events_url`.
    pub sdk_url: Url,
    pub events_url: Url,
    pub listener_port: u16,
    pub api_key: Option<String>,
    pub impressions_threshold: usize,
    pub impressions_workers: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
    pub export_timeout: Duration,
    pub compression: Compression,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with("SPLIT_RELAY_") || k.starts_with("SPLITIO_"))
            .collect();
        Self::parse(&vars)
    }

    fn parse(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let sdk_url = parse_url(vars, "SPLITIO_SDK_URL", DEFAULT_SDK_URL)?;
        let events_url = parse_url(vars, "SPLITIO_EVENTS_URL", DEFAULT_EVENTS_URL)?;
        let listener_port = parse_number(vars, "SPLIT_RELAY_LISTENER_PORT", 3000)?;
        let api_key = vars
            .get("SPLIT_RELAY_API_KEY")
            .filter(|s| !s.is_empty())
            .cloned();
        let impressions_threshold = parse_number(vars, "SPLIT_RELAY_IMPRESSIONS_THRESHOLD", 500)?;
        let impressions_workers = parse_positive(vars, "SPLIT_RELAY_IMPRESSIONS_WORKERS", 10)?;
        let flush_interval =
            Duration::from_millis(parse_positive(vars, "SPLIT_RELAY_FLUSH_INTERVAL_MS", 30_000)?);
        let queue_capacity = parse_positive(vars, "SPLIT_RELAY_QUEUE_CAPACITY", 1024)?;
        let export_timeout =
            Duration::from_millis(parse_positive(vars, "SPLIT_RELAY_EXPORT_TIMEOUT_MS", 5000)?);
        let compression = parse_compression(vars)?;

        Ok(Self {
            sdk_url,
            events_url,
            listener_port,
            api_key,
            impressions_threshold,
            impressions_workers,
            flush_interval,
            queue_capacity,
            export_timeout,
            compression,
        })
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            threshold: self.impressions_threshold,
            workers: self.impressions_workers,
            flush_interval: self.flush_interval,
            queue_capacity: self.queue_capacity,
        }
    }
}

fn parse_url(vars: &HashMap<String, String>, name: &str, default: &str) -> Result<Url, ConfigError> {
    let raw = vars
        .get(name)
        .map(|s| s.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(default);

    Url::parse(raw).map_err(|_| ConfigError::InvalidUrl(name.to_owned(), raw.to_owned()))
}

fn parse_number<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(val) => val
            .parse()
            .map_err(|_| ConfigError::InvalidNumeric(name.to_owned(), val.clone())),
        None => Ok(default),
    }
}

fn parse_positive<T>(vars: &HashMap<String, String>, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
{
    let value = parse_number(vars, name, default)?;
    if value == T::default() {
        return Err(ConfigError::MustBePositive(name.to_owned()));
    }
    Ok(value)
}

fn parse_compression(vars: &HashMap<String, String>) -> Result<Compression, ConfigError> {
    match vars.get("SPLIT_RELAY_COMPRESSION").map(|s| s.as_str()) {
        Some("none") | None => Ok(Compression::None),
        Some("gzip") => Ok(Compression::Gzip),
        Some(other) => Err(ConfigError::InvalidCompression(other.to_owned())),
    }
}
