//! Three-tier configuration cascade
//!
//! Configurable scalars flow global → bus → channel. Each tier either
//! inherits from the tier below, explicitly unsets (no timeout /
//! unbounded / throttle disabled), or sets a value; the [`Override`]
//! sentinel keeps "inherit" distinct from "explicitly nothing". The
//! channel constructor receives fully resolved scalars and never sees
//! the cascade. `log_level` exists only at the global tier and is
//! consumed by the embedding application's tracing subscriber.

use crate::channel::ChannelOptions;
use crate::error::{BusError, Result};
use crate::message::TypeConstraint;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Process-wide defaults — the outermost tier
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    /// Default per-delivery acknowledgment timeout in seconds
    pub timeout_secs: Option<f64>,

    /// Default bound on simultaneously pending publishes
    pub max_pending: Option<usize>,

    /// Default throttle threshold; 0 disables throttling
    pub throttle: f64,

    /// Log level for the application's tracing subscriber
    pub log_level: Option<String>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            max_pending: None,
            throttle: 0.0,
            log_level: None,
        }
    }
}

impl GlobalConfig {
    /// Load global defaults from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BusError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: GlobalConfig = serde_json::from_str(&json)?;
        tracing::debug!(path = %path.display(), "Global config loaded");
        Ok(config)
    }
}

/// A single tier's override of one scalar
///
/// `Inherit` takes the lower tier's value; `Unset` is explicitly
/// nothing (no timeout / unbounded / disabled); `Value` sets one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Override<T> {
    #[default]
    Inherit,
    Unset,
    Value(T),
}

impl<T> Override<T> {
    /// Resolve against an optional inherited value
    pub fn resolve(self, inherited: Option<T>) -> Option<T> {
        match self {
            Override::Inherit => inherited,
            Override::Unset => None,
            Override::Value(value) => Some(value),
        }
    }

    /// Resolve against a plain inherited value, with `unset` standing
    /// in for "explicitly nothing"
    pub fn resolve_with(self, inherited: T, unset: T) -> T {
        match self {
            Override::Inherit => inherited,
            Override::Unset => unset,
            Override::Value(value) => value,
        }
    }
}

/// Bus-level overrides applied on top of the global tier
#[derive(Debug, Clone, Default)]
pub struct BusOverrides {
    pub timeout_secs: Override<f64>,
    pub max_pending: Override<usize>,
    pub throttle: Override<f64>,
}

/// The resolved bus tier
#[derive(Debug, Clone, Default)]
pub struct BusConfig {
    pub timeout_secs: Option<f64>,
    pub max_pending: Option<usize>,
    pub throttle: f64,
}

impl BusConfig {
    /// Adopt the global defaults unchanged
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            timeout_secs: global.timeout_secs,
            max_pending: global.max_pending,
            throttle: global.throttle,
        }
    }

    /// Dup the global defaults with explicit overrides applied
    pub fn with_overrides(global: &GlobalConfig, overrides: &BusOverrides) -> Self {
        Self {
            timeout_secs: overrides.timeout_secs.resolve(global.timeout_secs),
            max_pending: overrides.max_pending.resolve(global.max_pending),
            throttle: overrides.throttle.resolve_with(global.throttle, 0.0),
        }
    }
}

/// Channel-level overrides, resolved against the bus tier
#[derive(Debug, Clone, Default)]
pub struct ChannelOverrides {
    pub timeout_secs: Override<f64>,
    pub max_pending: Override<usize>,
    pub throttle: Override<f64>,

    /// Payload type gate; channel-scoped, never cascaded
    pub message_type: Option<TypeConstraint>,
}

impl ChannelOverrides {
    /// Produce the fully resolved scalars for the channel constructor
    pub fn resolve(&self, bus: &BusConfig) -> ChannelOptions {
        ChannelOptions {
            timeout_secs: self.timeout_secs.resolve(bus.timeout_secs),
            max_pending: self.max_pending.resolve(bus.max_pending),
            throttle: self.throttle.resolve_with(bus.throttle, 0.0),
            message_type: self.message_type,
        }
    }
}
