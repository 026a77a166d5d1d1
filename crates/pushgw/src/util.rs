// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Utility functions shared by the adapters and the normalizer.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Rewrites a metric name into the Prometheus charset.
///
/// A valid name matches `[a-zA-Z_:][a-zA-Z0-9_:]*`. Every other character becomes `_`, and a
/// leading digit is prefixed with `_`.
///
/// # Examples
///
/// ```
/// use pushgw::util::sanitize_metric_name;
///
/// assert_eq!(sanitize_metric_name("system.cpu.user"), "system_cpu_user");
/// assert_eq!(sanitize_metric_name("net-if.in:bytes"), "net_if_in:bytes");
/// assert_eq!(sanitize_metric_name("1min.load"), "_1min_load");
/// ```
#[must_use]
pub fn sanitize_metric_name(name: &str) -> String {
    sanitize(name, true)
}

/// Rewrites a label name into the Prometheus charset (`[a-zA-Z_][a-zA-Z0-9_]*`).
///
/// # Examples
///
/// ```
/// use pushgw::util::sanitize_label_name;
///
/// assert_eq!(sanitize_label_name("dc.region"), "dc_region");
/// assert_eq!(sanitize_label_name("a:b"), "a_b");
/// ```
#[must_use]
pub fn sanitize_label_name(name: &str) -> String {
    sanitize(name, false)
}

fn sanitize(name: &str, allow_colon: bool) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    for (i, ch) in name.chars().enumerate() {
        let valid = ch.is_ascii_alphabetic() || ch == '_' || (allow_colon && ch == ':');
        if valid {
            out.push(ch);
        } else if ch.is_ascii_digit() {
            if i == 0 {
                out.push('_');
            }
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}

/// Parses a sample value that may arrive either as a JSON number or a numeric string.
pub(crate) fn value_from_json(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
