// Receiver defaults and environment/YAML configuration helpers.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

pub(crate) const DEFAULT_BUFFER_CAPACITY: usize = 50;

/// Ceiling on cache requests submitted but not yet resolved.
///
/// Responses travel over a bounded channel of the same depth, so the
/// transport callback that forwards them can never find it full.
pub const MAX_OUTSTANDING_CACHE_REQUESTS: usize = 1024;

/// How a full inbound buffer resolves an arriving message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Evict the oldest queued message and keep the new one.
    DropOldest,
    /// Discard the new message and keep the buffer as it is.
    DropLatest,
}

impl BackpressurePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "drop_oldest" | "oldest" => Some(BackpressurePolicy::DropOldest),
            "drop_latest" | "latest" => Some(BackpressurePolicy::DropLatest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackpressurePolicy::DropOldest => "drop_oldest",
            BackpressurePolicy::DropLatest => "drop_latest",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub backpressure: BackpressurePolicy,
    pub buffer_capacity: usize,
    pub share_name: Option<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            backpressure: BackpressurePolicy::DropOldest,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            share_name: None,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ReceiverConfigOverride {
    backpressure: Option<String>,
    buffer_capacity: Option<usize>,
    share_name: Option<String>,
}

impl ReceiverConfig {
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_RECEIVER_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => match fs::read_to_string(path) {
                Ok(contents) => Some(contents),
                Err(err) => {
                    return Err(err).with_context(|| format!("read receiver config: {path}"));
                }
            },
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ReceiverConfigOverride =
                serde_yaml::from_str(&contents).context("parse receiver config yaml")?;
            override_cfg.apply(&mut config)?;
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = std::env::var("COURIER_RECEIVER_BACKPRESSURE")
            .ok()
            .and_then(|value| BackpressurePolicy::parse(&value))
        {
            config.backpressure = value;
        }
        if let Some(value) = read_usize_env("COURIER_RECEIVER_BUFFER_CAPACITY") {
            config.buffer_capacity = value;
        }
        if let Ok(value) = std::env::var("COURIER_RECEIVER_SHARE_NAME")
            && !value.is_empty()
        {
            config.share_name = Some(value);
        }
        config
    }
}

impl ReceiverConfigOverride {
    fn apply(&self, config: &mut ReceiverConfig) -> Result<()> {
        if let Some(value) = &self.backpressure {
            config.backpressure = BackpressurePolicy::parse(value)
                .with_context(|| format!("unknown backpressure policy: {value}"))?;
        }
        if let Some(value) = self.buffer_capacity
            && value > 0
        {
            config.buffer_capacity = value;
        }
        if let Some(value) = &self.share_name
            && !value.is_empty()
        {
            config.share_name = Some(value.clone());
        }
        Ok(())
    }
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
