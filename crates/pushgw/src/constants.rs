// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Label holding the metric name in Prometheus label sets.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Label carrying the agent identifier on every attributed series.
pub const IDENT_LABEL: &str = "ident";

/// Label some agents use instead of `ident`.
pub const HOST_LABEL: &str = "host";

/// Default label the business group label value is written to.
pub const BUSIGROUP_LABEL: &str = "busigroup";

/// Longest accepted agent identifier, in bytes.
pub const MAX_IDENT_LEN: usize = 255;

/// Number of independently locked registry shards.
pub const REGISTRY_SHARDS: usize = 32;

/// OpenTSDB timestamps above this are already in milliseconds.
pub const MILLIS_TIMESTAMP_THRESHOLD: i64 = 1_000_000_000_000;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:17000";
pub const DEFAULT_CONFIG_PATH: &str = "pushgw.yaml";
pub const ENV_PREFIX: &str = "PUSHGW_";
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 50 * 1024 * 1024;
