// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::adapters::set_ident_tag;
use crate::errors::DecodeError;
use crate::sample::{Point, RawSample};
use crate::util::{sanitize_label_name, sanitize_metric_name, value_from_json};
use serde::Deserialize;

/// `step` and `counterType` are accepted and ignored.
#[derive(Debug, Deserialize)]
struct FalconMetric {
    metric: String,
    #[serde(default)]
    endpoint: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    tags: String,
    value: serde_json::Value,
}

pub(crate) fn decode(body: &[u8]) -> Result<Vec<Result<RawSample, DecodeError>>, DecodeError> {
    let parsed: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| DecodeError::Json(e.to_string()))?;
    let items = match parsed {
        serde_json::Value::Array(items) => items,
        item @ serde_json::Value::Object(_) => vec![item],
        _ => {
            return Err(DecodeError::Json(
                "expected an object or an array of objects".to_string(),
            ))
        }
    };
    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| convert(index, item))
        .collect())
}

fn convert(index: usize, item: serde_json::Value) -> Result<RawSample, DecodeError> {
    let metric: FalconMetric =
        serde_json::from_value(item).map_err(|e| DecodeError::record(index, e.to_string()))?;
    if metric.metric.is_empty() {
        return Err(DecodeError::record(index, "empty metric name"));
    }
    let value = value_from_json(&metric.value)
        .ok_or_else(|| DecodeError::record(index, format!("invalid value {}", metric.value)))?;

    let mut tags = parse_tags(&metric.tags)
        .map_err(|tag| DecodeError::record(index, format!("invalid tag {tag:?}")))?;
    let endpoint = metric.endpoint.trim();
    let source = if endpoint.is_empty() {
        None
    } else {
        set_ident_tag(&mut tags, endpoint);
        Some(endpoint.to_string())
    };
    let timestamp = metric.timestamp.map(|ts| ts.saturating_mul(1000));

    Ok(RawSample {
        name: sanitize_metric_name(&metric.metric),
        tags,
        points: vec![Point { timestamp, value }],
        source,
    })
}

/// Parses `k=v,k2=v2`. Returns the offending fragment on failure.
fn parse_tags(raw: &str) -> Result<Vec<(String, String)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|tag| match tag.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((sanitize_label_name(k.trim()), v.trim().to_string()))
            }
            _ => Err(tag.to_string()),
        })
        .filter(|t| !matches!(t, Ok((_, v)) if v.is_empty()))
        .collect()
}
