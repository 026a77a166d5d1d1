// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Datadog agent `/api/v1/series` intake.

use crate::adapters::set_ident_tag;
use crate::errors::DecodeError;
use crate::sample::{Point, RawSample};
use crate::util::{sanitize_label_name, sanitize_metric_name, value_from_json};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct SeriesPayload {
    series: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Series {
    metric: String,
    points: Vec<(serde_json::Value, serde_json::Value)>,
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    device: Option<String>,
}

pub(crate) fn decode(body: &[u8]) -> Result<Vec<Result<RawSample, DecodeError>>, DecodeError> {
    let payload: SeriesPayload =
        serde_json::from_slice(body).map_err(|e| DecodeError::Json(e.to_string()))?;
    Ok(payload
        .series
        .into_iter()
        .enumerate()
        .map(|(index, series)| convert(index, series))
        .collect())
}

fn convert(index: usize, series: serde_json::Value) -> Result<RawSample, DecodeError> {
    let series: Series =
        serde_json::from_value(series).map_err(|e| DecodeError::record(index, e.to_string()))?;
    if series.metric.is_empty() {
        return Err(DecodeError::record(index, "empty metric name"));
    }
    if series.points.is_empty() {
        return Err(DecodeError::record(
            index,
            format!("series {} has no points", series.metric),
        ));
    }

    let mut points = Vec::with_capacity(series.points.len());
    for (ts, value) in &series.points {
        let ts = ts
            .as_f64()
            .ok_or_else(|| DecodeError::record(index, format!("invalid timestamp {ts}")))?;
        let value = value_from_json(value)
            .ok_or_else(|| DecodeError::record(index, format!("invalid value {value}")))?;
        #[allow(clippy::cast_possible_truncation)]
        let timestamp = Some((ts * 1000.0) as i64);
        points.push(Point { timestamp, value });
    }

    let mut tags: Vec<(String, String)> = series
        .tags
        .unwrap_or_default()
        .iter()
        .filter_map(|tag| tag.split_once(':'))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| (sanitize_label_name(k), v.to_string()))
        .collect();
    if let Some(device) = series.device.filter(|d| !d.is_empty()) {
        tags.push(("device".to_string(), device));
    }
    let source = series.host.filter(|h| !h.is_empty());
    if let Some(host) = &source {
        set_ident_tag(&mut tags, host);
    }

    Ok(RawSample {
        name: sanitize_metric_name(&series.metric),
        tags,
        points,
        source,
    })
}
