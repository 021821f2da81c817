// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{de::Error, Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::store::SessionConfig;

fn parse_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(D::Error::custom)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BenchmarkConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Seed for the deterministic user material.
    #[serde(default)]
    pub seed: u64,
    pub workload: WorkloadConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl BenchmarkConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = path.as_ref().display().to_string();
        let data = std::fs::read(path.as_ref()).map_err(|e| ConfigError::InvalidFile {
            file: file.clone(),
            message: e.to_string(),
        })?;
        let config: Self = serde_yaml::from_slice(&data).map_err(|e| ConfigError::InvalidFile {
            file,
            message: e.to_string(),
        })?;
        config.workload.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| ConfigError::InvalidFile {
            file: "<inline>".to_string(),
            message: e.to_string(),
        })?;
        config.workload.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkloadConfig {
    pub name: String,
    pub user_count: u64,
    /// One entry per load-generating process; its position is the worker rank.
    #[serde(default)]
    pub workers: Vec<String>,
    #[serde(deserialize_with = "parse_duration")]
    pub duration: Duration,
    #[serde(default, deserialize_with = "parse_duration")]
    pub warmup_duration: Duration,
    #[serde(
        default = "default_report_interval",
        deserialize_with = "parse_duration"
    )]
    pub report_interval: Duration,
    /// Extra time the coordinator waits for workers still finishing their
    /// last attempt after the deadline.
    #[serde(default = "default_grace_period", deserialize_with = "parse_duration")]
    pub grace_period: Duration,
    #[serde(default)]
    pub metrics_address: Option<SocketAddr>,
    #[serde(default)]
    pub session: SessionConf,
    #[serde(default)]
    pub distributions: Vec<DistributionEntry>,
    #[serde(default)]
    pub parameters: Parameters,
}

fn default_report_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}

impl WorkloadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_count == 0 {
            return Err(ConfigError::Invalid("user-count must be positive".into()));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "report-interval must be positive".into(),
            ));
        }
        self.session.backoff.validate()
    }

    pub fn worker_count(&self) -> u64 {
        (self.workers.len() as u64).max(1)
    }

    /// Users driven by the load generator of rank `rank`: `rank`, `rank + W`,
    /// `rank + 2W`, ... where `W` is the number of workers.
    pub fn worker_users(&self, rank: u64) -> Vec<u64> {
        let step = self.worker_count();
        if rank >= step {
            return vec![];
        }
        (rank..self.user_count).step_by(step as usize).collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConf {
    #[serde(default = "default_timeout", deserialize_with = "parse_duration")]
    pub tx_timeout: Duration,
    #[serde(default = "default_timeout", deserialize_with = "parse_duration")]
    pub query_timeout: Duration,
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            tx_timeout: default_timeout(),
            query_timeout: default_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl SessionConf {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            tx_timeout: self.tx_timeout,
            query_timeout: self.query_timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BackoffConfig {
    #[serde(deserialize_with = "parse_duration")]
    pub initial_interval: Duration,
    pub randomization_factor: f64,
    pub multiplier: f64,
    #[serde(deserialize_with = "parse_duration")]
    pub max_interval: Duration,
    #[serde(deserialize_with = "parse_duration")]
    pub max_elapsed_time: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(10),
            randomization_factor: 0.5,
            multiplier: 1.5,
            max_interval: Duration::from_secs(1),
            max_elapsed_time: Duration::from_secs(60),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.randomization_factor) {
            return Err(ConfigError::Invalid(format!(
                "backoff randomization-factor must be within [0, 1], got {}",
                self.randomization_factor
            )));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff multiplier must be at least 1, got {}",
                self.multiplier
            )));
        }
        if self.initial_interval > self.max_interval {
            return Err(ConfigError::Invalid(
                "backoff initial-interval exceeds max-interval".into(),
            ));
        }
        Ok(())
    }
}

/// One entry of the operation mix. Either `percent` or `weight` may be given;
/// an entry with neither has weight 1.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DistributionEntry {
    #[serde(default)]
    pub percent: Option<u32>,
    #[serde(default)]
    pub weight: Option<u32>,
    pub operation: String,
}

impl DistributionEntry {
    pub fn weighted(weight: u32, operation: impl Into<String>) -> Self {
        Self {
            percent: None,
            weight: Some(weight),
            operation: operation.into(),
        }
    }

    pub fn percent(percent: u32, operation: impl Into<String>) -> Self {
        Self {
            percent: Some(percent),
            weight: None,
            operation: operation.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ScalarValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<ScalarValue> for String {
    fn from(value: ScalarValue) -> Self {
        match value {
            ScalarValue::Bool(b) => b.to_string(),
            ScalarValue::Int(i) => i.to_string(),
            ScalarValue::Float(f) => f.to_string(),
            ScalarValue::Str(s) => s,
        }
    }
}

/// Free-form workload parameters with typed lookups. Every lookup of a
/// missing or malformed value is a configuration error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "BTreeMap<String, ScalarValue>")]
pub struct Parameters(BTreeMap<String, String>);

impl From<BTreeMap<String, ScalarValue>> for Parameters {
    fn from(map: BTreeMap<String, ScalarValue>) -> Self {
        Self(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Parameters {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Parameters {
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get_string(&self, key: &str) -> Result<&str, ConfigError> {
        self.0
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ConfigError::MissingParameter(key.to_string()))
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, ConfigError> {
        self.parse(key)
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, ConfigError> {
        self.parse(key)
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        self.parse(key)
    }

    fn parse<T>(&self, key: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let value = self.get_string(key)?;
        value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::MalformedParameter {
                key: key.to_string(),
                value: value.to_string(),
                reason: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
log-level: debug
workload:
  name: independent
  user-count: 5
  workers: [a, b]
  duration: 30s
  warmup-duration: 1m 30s
  session:
    backoff:
      initial-interval: 20ms
      max-elapsed-time: 2m
  distributions:
    - percent: 70
      operation: "-read 1 -write 1"
    - percent: 30
      operation: "-query 10"
  parameters:
    lines-per-user: 100
    commits-per-sync: "10"
    with-acl: true
    ratio: 0.25
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let config = BenchmarkConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.log_level, "debug");
        let workload = &config.workload;
        assert_eq!(workload.duration, Duration::from_secs(30));
        assert_eq!(workload.warmup_duration, Duration::from_secs(90));
        assert_eq!(workload.report_interval, Duration::from_secs(5));
        assert_eq!(workload.grace_period, Duration::from_secs(10));
        assert_eq!(workload.metrics_address, None);

        let backoff = &workload.session.backoff;
        assert_eq!(backoff.initial_interval, Duration::from_millis(20));
        assert_eq!(backoff.max_elapsed_time, Duration::from_secs(120));
        assert_eq!(backoff.multiplier, 1.5);
        assert_eq!(backoff.max_interval, Duration::from_secs(1));

        assert_eq!(workload.distributions.len(), 2);
        assert_eq!(workload.distributions[0].percent, Some(70));
    }

    #[test]
    fn typed_parameter_lookups() {
        let config = BenchmarkConfig::from_yaml(CONFIG).unwrap();
        let params = &config.workload.parameters;
        assert_eq!(params.get_u64("lines-per-user").unwrap(), 100);
        assert_eq!(params.get_u64("commits-per-sync").unwrap(), 10);
        assert!(params.get_bool("with-acl").unwrap());
        assert_eq!(params.get_f64("ratio").unwrap(), 0.25);
        assert!(matches!(
            params.get_u64("missing"),
            Err(ConfigError::MissingParameter(_))
        ));
        assert!(matches!(
            params.get_bool("lines-per-user"),
            Err(ConfigError::MalformedParameter { .. })
        ));
    }

    #[test]
    fn users_are_partitioned_by_rank() {
        let config = BenchmarkConfig::from_yaml(CONFIG).unwrap();
        assert_eq!(config.workload.worker_users(0), vec![0, 2, 4]);
        assert_eq!(config.workload.worker_users(1), vec![1, 3]);
        assert!(config.workload.worker_users(2).is_empty());
    }

    #[test]
    fn rejects_bad_backoff() {
        let yaml = CONFIG.replace("initial-interval: 20ms", "initial-interval: 5s");
        assert!(BenchmarkConfig::from_yaml(&yaml).is_err());
    }
}
