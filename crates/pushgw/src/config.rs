// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Gateway configuration.
//!
//! Sources, lowest priority first:
//! 1. Defaults
//! 2. YAML file (`PUSHGW_CONFIG`, default `pushgw.yaml`), skipped when absent
//! 3. `PUSHGW_*` environment variables, nested keys separated by `__`
//!    (`PUSHGW_DISPATCHER__QUEUE_CAPACITY=64`)

use crate::adapters::{DecodePolicy, Protocol};
use crate::constants::{
    DEFAULT_CONFIG_PATH, DEFAULT_LISTEN, DEFAULT_MAX_REQUEST_BODY_BYTES, ENV_PREFIX,
};
use crate::dispatcher::DispatcherConfig;
use crate::errors::ConfigError;
use crate::normalizer::NormalizerConfig;
use crate::relabel::{RelabelConfig, Relabeler};
use crate::writer::WriterConfig;
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "PUSHGW_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub log_level: String,
    pub ident: IdentConfig,
    pub normalizer: NormalizerConfig,
    pub protocols: ProtocolsConfig,
    pub dispatcher: DispatcherConfig,
    pub writers: Vec<WriterConfig>,
    /// Global relabel rules, run by the normalizer on every sample.
    pub relabel: Vec<RelabelConfig>,
    pub targets: TargetsConfig,
    pub max_request_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: DEFAULT_LISTEN.to_string(),
            log_level: "info".to_string(),
            ident: IdentConfig::default(),
            normalizer: NormalizerConfig::default(),
            protocols: ProtocolsConfig::default(),
            dispatcher: DispatcherConfig::default(),
            writers: Vec::new(),
            relabel: Vec::new(),
            targets: TargetsConfig::default(),
            max_request_body_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentConfig {
    /// An identity without a heartbeat for this long is swept.
    pub ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for IdentConfig {
    fn default() -> Self {
        IdentConfig {
            ttl_secs: 180,
            sweep_interval_secs: 30,
        }
    }
}

impl IdentConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Decode policy overrides. Unset protocols keep their default policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub remote_write: Option<DecodePolicy>,
    pub opentsdb: Option<DecodePolicy>,
    pub falcon: Option<DecodePolicy>,
    pub datadog: Option<DecodePolicy>,
}

impl ProtocolsConfig {
    /// Overrides set in configuration.
    #[must_use]
    pub fn overrides(&self) -> Vec<(Protocol, DecodePolicy)> {
        [
            (Protocol::RemoteWrite, self.remote_write),
            (Protocol::OpenTsdb, self.opentsdb),
            (Protocol::Falcon, self.falcon),
            (Protocol::Datadog, self.datadog),
        ]
        .into_iter()
        .filter_map(|(protocol, policy)| policy.map(|p| (protocol, p)))
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsConfig {
    /// YAML file with known targets and business groups.
    pub file: Option<PathBuf>,
    pub reload_interval_secs: u64,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        TargetsConfig {
            file: None,
            reload_interval_secs: 60,
        }
    }
}

impl TargetsConfig {
    #[must_use]
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

/// Loads the configuration from the file named by `PUSHGW_CONFIG`, or `pushgw.yaml`.
pub fn load() -> Result<Config, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    load_from(Path::new(&path))
}

/// Loads and validates the configuration, reading YAML from `path` when it exists.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::from(Serialized::defaults(Config::default()))
        .merge(Yaml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]).split("__"))
        .extract()
        .map_err(|e| ConfigError::Load(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        SocketAddr::from_str(&self.listen)
            .map_err(|e| ConfigError::Invalid(format!("listen address {}: {e}", self.listen)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_addr()?.port() == 0 {
            return Err(ConfigError::Invalid("listen port must not be 0".to_string()));
        }
        if tracing::Level::from_str(&self.log_level).is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level {}",
                self.log_level
            )));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.queue_capacity must be positive".to_string(),
            ));
        }
        if self.dispatcher.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.batch_size must be positive".to_string(),
            ));
        }
        if self.dispatcher.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.retry.max_attempts must be positive".to_string(),
            ));
        }
        if self.ident.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "ident.sweep_interval_secs must be positive".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for writer in &self.writers {
            if writer.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "writer for {} has no name",
                    writer.url
                )));
            }
            if writer.url.is_empty() {
                return Err(ConfigError::Invalid(format!("writer {} has no url", writer.name)));
            }
            if !names.insert(writer.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate writer name {}",
                    writer.name
                )));
            }
            Relabeler::new(&writer.write_relabels)?;
        }
        Relabeler::new(&self.relabel)?;
        Ok(())
    }
}
