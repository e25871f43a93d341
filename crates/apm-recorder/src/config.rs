// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::constants;
use crate::errors::ConfigError;

/// Set of fully-qualified error class names, e.g. `std::io::Error`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassNameList {
    names: HashSet<String>,
}

impl ClassNameList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env_string(env_names: &str) -> Self {
        // Space-separated names are the documented format, comma-separated
        // names are accepted as well.
        let names = env_names
            .replace(',', " ")
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Self { names }
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.names.contains(class_name)
    }

    pub fn insert(&mut self, class_name: impl Into<String>) {
        self.names.insert(class_name.into());
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

impl<S: Into<String>> FromIterator<S> for ClassNameList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub max_errors_per_transaction: usize,
    pub max_errors_per_harvest: usize,
    pub max_custom_events_per_transaction: usize,
    pub max_custom_events_per_harvest: usize,
    pub max_user_attributes: usize,
    /// Errors whose class is listed here are never recorded.
    pub ignore_errors: ClassNameList,
    /// Errors whose class is listed here are recorded but flagged as expected.
    pub expected_errors: ClassNameList,
    pub harvest_interval: Duration,
    /// Probability, in `[0, 1]`, that a new transaction is sampled.
    pub trace_sample_rate: f32,
    pub distributed_tracing_enabled: bool,
    pub capture_stack_traces: bool,
    pub error_collector_enabled: bool,
    pub custom_events_enabled: bool,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_errors_per_transaction: constants::MAX_ERRORS_PER_TRANSACTION,
            max_errors_per_harvest: constants::MAX_ERRORS_PER_HARVEST,
            max_custom_events_per_transaction: constants::MAX_CUSTOM_EVENTS_PER_TRANSACTION,
            max_custom_events_per_harvest: constants::MAX_CUSTOM_EVENTS_PER_HARVEST,
            max_user_attributes: constants::MAX_USER_ATTRIBUTES,
            ignore_errors: ClassNameList::new(),
            expected_errors: ClassNameList::new(),
            harvest_interval: Duration::from_secs(constants::HARVEST_INTERVAL_SECS),
            trace_sample_rate: 1.0,
            distributed_tracing_enabled: true,
            capture_stack_traces: true,
            error_collector_enabled: true,
            custom_events_enabled: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Builds a configuration from `DD_APM_*` environment variables, using
    /// the defaults for anything unset or unparsable.
    pub fn from_env() -> Result<Config, ConfigError> {
        let defaults = Config::default();

        let harvest_interval_secs = env_parse(
            "DD_APM_HARVEST_INTERVAL_SECS",
            constants::HARVEST_INTERVAL_SECS,
        );
        if harvest_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "DD_APM_HARVEST_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }

        let ignore_errors = env::var("DD_APM_IGNORE_ERRORS")
            .map(|names| ClassNameList::from_env_string(&names))
            .unwrap_or_default();
        let expected_errors = env::var("DD_APM_EXPECTED_ERRORS")
            .map(|names| ClassNameList::from_env_string(&names))
            .unwrap_or_default();

        Ok(Config {
            max_errors_per_transaction: env_parse(
                "DD_APM_MAX_ERRORS_PER_TRANSACTION",
                defaults.max_errors_per_transaction,
            ),
            max_errors_per_harvest: env_parse(
                "DD_APM_MAX_ERRORS_PER_HARVEST",
                defaults.max_errors_per_harvest,
            ),
            max_custom_events_per_transaction: env_parse(
                "DD_APM_MAX_CUSTOM_EVENTS_PER_TRANSACTION",
                defaults.max_custom_events_per_transaction,
            ),
            max_custom_events_per_harvest: env_parse(
                "DD_APM_MAX_CUSTOM_EVENTS_PER_HARVEST",
                defaults.max_custom_events_per_harvest,
            ),
            max_user_attributes: env_parse(
                "DD_APM_MAX_USER_ATTRIBUTES",
                defaults.max_user_attributes,
            ),
            ignore_errors,
            expected_errors,
            harvest_interval: Duration::from_secs(harvest_interval_secs),
            trace_sample_rate: sample_rate("DD_TRACE_SAMPLE_RATE", defaults.trace_sample_rate),
            distributed_tracing_enabled: env_flag(
                "DD_APM_DISTRIBUTED_TRACING_ENABLED",
                defaults.distributed_tracing_enabled,
            ),
            capture_stack_traces: env_flag(
                "DD_APM_CAPTURE_STACK_TRACES",
                defaults.capture_stack_traces,
            ),
            error_collector_enabled: env_flag(
                "DD_APM_ERROR_COLLECTOR_ENABLED",
                defaults.error_collector_enabled,
            ),
            custom_events_enabled: env_flag(
                "DD_APM_CUSTOM_EVENTS_ENABLED",
                defaults.custom_events_enabled,
            ),
            log_level: env::var("DD_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        })
    }
}

fn env_parse<T: FromStr + Copy + std::fmt::Display>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!("Invalid value '{raw}' for {name}, using default {default}");
            default
        }),
        Err(_) => default,
    }
}

/// A rate in `0.0..=1.0`. Out of range values are clamped, `NaN` and
/// infinities fall back to `default`.
fn sample_rate(name: &str, default: f32) -> f32 {
    let rate = env_parse(name, default);
    if !rate.is_finite() {
        warn!("Invalid value '{rate}' for {name}, using default {default}");
        return default;
    }
    rate.clamp(0.0, 1.0)
}

fn env_flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|val| match val.trim().to_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => default,
        })
        .unwrap_or(default)
}
