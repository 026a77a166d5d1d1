// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::adapters::extract_ident;
use crate::constants::METRIC_NAME_LABEL;
use crate::errors::DecodeError;
use crate::prompb::{TimeSeries, WriteRequest};
use crate::sample::{Point, RawSample};
use prost::Message;

/// Decodes an already decompressed `WriteRequest`.
///
/// A protobuf failure fails the request whatever the policy.
pub(crate) fn decode(
    body: &[u8],
    ident_keys: &[String],
) -> Result<Vec<Result<RawSample, DecodeError>>, DecodeError> {
    let request = WriteRequest::decode(body).map_err(|e| DecodeError::Protobuf(e.to_string()))?;
    Ok(request
        .timeseries
        .into_iter()
        .enumerate()
        .map(|(index, series)| convert(index, series, ident_keys))
        .collect())
}

fn convert(
    index: usize,
    series: TimeSeries,
    ident_keys: &[String],
) -> Result<RawSample, DecodeError> {
    let mut name = None;
    let mut tags = Vec::with_capacity(series.labels.len());
    for label in series.labels {
        if label.name == METRIC_NAME_LABEL {
            name = Some(label.value);
        } else if !label.value.is_empty() {
            tags.push((label.name, label.value));
        }
    }
    let name = match name {
        Some(name) if !name.is_empty() => name,
        _ => return Err(DecodeError::record(index, "series has no __name__ label")),
    };
    if series.samples.is_empty() {
        return Err(DecodeError::record(
            index,
            format!("series {name} has no samples"),
        ));
    }
    let source = extract_ident(&mut tags, ident_keys);
    let points = series
        .samples
        .iter()
        .map(|s| Point {
            timestamp: Some(s.timestamp),
            value: s.value,
        })
        .collect();
    Ok(RawSample {
        name,
        tags,
        points,
        source,
    })
}
