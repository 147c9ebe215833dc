//! Engine configuration
//!
//! Every field has a default, so an empty JSON object or an empty environment
//! yields a working configuration. The environment surface:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `HILVAN_DISABLED` | `enabled` (inverted) | `false` |
//! | `HILVAN_OVERHEAD_PERCENT` | `overhead_percent` | `1.0` |
//! | `HILVAN_THROTTLE` | `throttle_when_overhead` | `false` |
//! | `HILVAN_TRACK_ALL_WORKERS` | `track_all_workers` | `false` |
//! | `HILVAN_CAPTURE_ERRORS` | `capture_errors` | `true` |
//! | `HILVAN_ERROR_TRACE_DEPTH` | `error_trace_depth_limit` | `1024` |

use crate::captured_stack::{FlattenPolicy, FrameFilter};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_DISABLED: &str = "HILVAN_DISABLED";
pub const ENV_OVERHEAD_PERCENT: &str = "HILVAN_OVERHEAD_PERCENT";
pub const ENV_THROTTLE: &str = "HILVAN_THROTTLE";
pub const ENV_TRACK_ALL_WORKERS: &str = "HILVAN_TRACK_ALL_WORKERS";
pub const ENV_CAPTURE_ERRORS: &str = "HILVAN_CAPTURE_ERRORS";
pub const ENV_ERROR_TRACE_DEPTH: &str = "HILVAN_ERROR_TRACE_DEPTH";

/// Errors raised while reading configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{var}: expected a boolean, found {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("{var}: expected a number, found {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var}: {value} is outside {min}..={max}")]
    OutOfRange {
        var: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Settings of a [`CorrelationEngine`](crate::engine::CorrelationEngine)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Start with capturing enabled
    pub enabled: bool,
    /// Share of CPU time the instrumentation may use (0-100)
    pub overhead_percent: f64,
    /// Skip operations while over budget instead of only reporting it
    pub throttle_when_overhead: bool,
    /// Register every worker's linkage so other threads can read it
    pub track_all_workers: bool,
    /// Record the linkage of newly created traced errors
    pub capture_errors: bool,
    /// Chains deeper than this are flattened
    pub flatten_depth: u32,
    /// Frame budget of a flattened chain
    pub flatten_frame_cap: usize,
    /// Frame limit of async error traces
    pub error_trace_depth_limit: usize,
    /// Steps after which a coroutine owner walk is treated as a cycle
    pub max_owner_walk: usize,
    /// Registry puts between two dead-slot sweeps
    pub sweep_interval: usize,
    /// Qualified-name prefixes of frames belonging to the instrumentation
    pub engine_frame_prefixes: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let flatten = FlattenPolicy::default();
        EngineConfig {
            enabled: true,
            overhead_percent: 1.0,
            throttle_when_overhead: false,
            track_all_workers: false,
            capture_errors: true,
            flatten_depth: flatten.depth,
            flatten_frame_cap: flatten.frame_cap,
            error_trace_depth_limit: 1024,
            max_owner_walk: 65_536,
            sweep_interval: crate::registry::DEFAULT_SWEEP_INTERVAL,
            engine_frame_prefixes: default_engine_frame_prefixes(),
        }
    }
}

fn default_engine_frame_prefixes() -> Vec<String> {
    [
        "backtrace::",
        "hilvan::engine::",
        "hilvan::stack_source::",
        "hilvan::governor::",
        "hilvan::log_capture::",
        "hilvan::traced_error::",
        "<hilvan::",
        "std::panic",
        "std::thread::local::",
        "core::panic",
        "core::ops::function::",
        "<core::panic::",
        "__rust",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

impl EngineConfig {
    /// Read overrides from `HILVAN_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Read overrides through `lookup`, starting from the defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        if let Some(value) = lookup(ENV_DISABLED) {
            config.enabled = !parse_bool(ENV_DISABLED, &value)?;
        }
        if let Some(value) = lookup(ENV_OVERHEAD_PERCENT) {
            let percent: f64 = value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                var: ENV_OVERHEAD_PERCENT,
                value: value.clone(),
            })?;
            if !(0.0..=100.0).contains(&percent) {
                return Err(ConfigError::OutOfRange {
                    var: ENV_OVERHEAD_PERCENT,
                    value: percent,
                    min: 0.0,
                    max: 100.0,
                });
            }
            config.overhead_percent = percent;
        }
        if let Some(value) = lookup(ENV_THROTTLE) {
            config.throttle_when_overhead = parse_bool(ENV_THROTTLE, &value)?;
        }
        if let Some(value) = lookup(ENV_TRACK_ALL_WORKERS) {
            config.track_all_workers = parse_bool(ENV_TRACK_ALL_WORKERS, &value)?;
        }
        if let Some(value) = lookup(ENV_CAPTURE_ERRORS) {
            config.capture_errors = parse_bool(ENV_CAPTURE_ERRORS, &value)?;
        }
        if let Some(value) = lookup(ENV_ERROR_TRACE_DEPTH) {
            config.error_trace_depth_limit =
                value.trim().parse().map_err(|_| ConfigError::InvalidNumber {
                    var: ENV_ERROR_TRACE_DEPTH,
                    value: value.clone(),
                })?;
        }

        Ok(config)
    }

    pub fn flatten_policy(&self) -> FlattenPolicy {
        FlattenPolicy {
            depth: self.flatten_depth,
            frame_cap: self.flatten_frame_cap,
        }
    }

    pub fn frame_filter(&self) -> FrameFilter {
        FrameFilter::new(self.engine_frame_prefixes.iter().cloned())
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.enabled);
        assert_eq!(config.overhead_percent, 1.0);
        assert!(!config.throttle_when_overhead);
        assert!(!config.track_all_workers);
        assert!(config.capture_errors);
        assert_eq!(config.flatten_depth, 100);
        assert_eq!(config.flatten_frame_cap, 500);
        assert_eq!(config.error_trace_depth_limit, 1024);
        assert_eq!(config.max_owner_walk, 65_536);
        assert_eq!(config.sweep_interval, 64);
    }

    #[test]
    fn test_empty_environment_is_default() {
        assert_eq!(EngineConfig::from_lookup(lookup(&[])).unwrap(), EngineConfig::default());
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_DISABLED, "true"),
            (ENV_OVERHEAD_PERCENT, "2.5"),
            (ENV_THROTTLE, "1"),
            (ENV_TRACK_ALL_WORKERS, "yes"),
            (ENV_CAPTURE_ERRORS, "off"),
            (ENV_ERROR_TRACE_DEPTH, " 64 "),
        ]))
        .unwrap();
        assert!(!config.enabled);
        assert_eq!(config.overhead_percent, 2.5);
        assert!(config.throttle_when_overhead);
        assert!(config.track_all_workers);
        assert!(!config.capture_errors);
        assert_eq!(config.error_trace_depth_limit, 64);
    }

    #[test]
    fn test_invalid_bool() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_THROTTLE, "maybe")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidBool {
                var: ENV_THROTTLE,
                value: "maybe".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_number() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_ERROR_TRACE_DEPTH, "-4")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
    }

    #[test]
    fn test_overhead_out_of_range() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_OVERHEAD_PERCENT, "250")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { .. }));
        assert!(err.to_string().contains("HILVAN_OVERHEAD_PERCENT"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"overhead_percent": 5.0}"#).unwrap();
        assert_eq!(config.overhead_percent, 5.0);
        assert_eq!(config.flatten_depth, 100);
        assert!(config.enabled);
    }

    #[test]
    fn test_frame_filter_from_prefixes() {
        let config = EngineConfig::default();
        let filter = config.frame_filter();
        assert!(filter.is_engine_frame(&crate::frame::Frame::call("backtrace::capture", "trace", 1)));
        assert!(!filter.is_engine_frame(&crate::frame::Frame::call("app", "main", 1)));
    }
}
