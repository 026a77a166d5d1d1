// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OpenTSDB `put`, both the telnet-style text lines and the HTTP JSON variant.

use crate::adapters::extract_ident;
use crate::constants::MILLIS_TIMESTAMP_THRESHOLD;
use crate::errors::DecodeError;
use crate::sample::{Point, RawSample};
use crate::util::{sanitize_label_name, sanitize_metric_name, value_from_json};
use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
struct JsonPoint {
    metric: String,
    #[serde(default)]
    timestamp: serde_json::Value,
    value: serde_json::Value,
    #[serde(default)]
    tags: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonBody {
    Many(Vec<serde_json::Value>),
    One(serde_json::Value),
}

pub(crate) fn decode(
    body: &[u8],
    json: bool,
    ident_keys: &[String],
) -> Result<Vec<Result<RawSample, DecodeError>>, DecodeError> {
    // Some agents post JSON as text/plain.
    let looks_like_json = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'[' || *b == b'{');
    if json || looks_like_json {
        decode_json(body, ident_keys)
    } else {
        decode_lines(body, ident_keys)
    }
}

fn decode_json(
    body: &[u8],
    ident_keys: &[String],
) -> Result<Vec<Result<RawSample, DecodeError>>, DecodeError> {
    let items = match serde_json::from_slice::<JsonBody>(body)
        .map_err(|e| DecodeError::Json(e.to_string()))?
    {
        JsonBody::Many(items) => items,
        JsonBody::One(item) => vec![item],
    };
    Ok(items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            let point: JsonPoint = serde_json::from_value(item)
                .map_err(|e| DecodeError::record(index, e.to_string()))?;
            let value = value_from_json(&point.value)
                .ok_or_else(|| DecodeError::record(index, format!("invalid value {}", point.value)))?;
            let timestamp = match &point.timestamp {
                serde_json::Value::Null => None,
                other => {
                    let raw = other
                        .as_i64()
                        .or_else(|| other.as_str().and_then(|s| s.trim().parse().ok()))
                        .ok_or_else(|| {
                            DecodeError::record(index, format!("invalid timestamp {other}"))
                        })?;
                    Some(to_millis(raw))
                }
            };
            let tags = point
                .tags
                .into_iter()
                .filter_map(|(k, v)| {
                    let v = match v {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Null => return None,
                        other => other.to_string(),
                    };
                    Some((k, v))
                })
                .collect();
            build(index, &point.metric, timestamp, value, tags, ident_keys)
        })
        .collect())
}

fn decode_lines(
    body: &[u8],
    ident_keys: &[String],
) -> Result<Vec<Result<RawSample, DecodeError>>, DecodeError> {
    let text = std::str::from_utf8(body).map_err(|_| DecodeError::Utf8)?;
    Ok(text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| parse_line(index, line, ident_keys))
        .collect())
}

fn parse_line(index: usize, line: &str, ident_keys: &[String]) -> Result<RawSample, DecodeError> {
    let mut fields = line.split_whitespace().peekable();
    if fields.peek() == Some(&"put") {
        fields.next();
    }
    let metric = fields
        .next()
        .ok_or_else(|| DecodeError::record(index, "missing metric"))?;
    let timestamp = fields
        .next()
        .ok_or_else(|| DecodeError::record(index, "missing timestamp"))?
        .parse::<i64>()
        .map_err(|e| DecodeError::record(index, format!("invalid timestamp: {e}")))?;
    let value = fields
        .next()
        .ok_or_else(|| DecodeError::record(index, "missing value"))?
        .parse::<f64>()
        .map_err(|e| DecodeError::record(index, format!("invalid value: {e}")))?;
    let mut tags = Vec::new();
    for field in fields {
        let (k, v) = field
            .split_once('=')
            .ok_or_else(|| DecodeError::record(index, format!("invalid tag {field:?}")))?;
        tags.push((k.to_string(), v.to_string()));
    }
    build(index, metric, Some(to_millis(timestamp)), value, tags, ident_keys)
}

fn build(
    index: usize,
    metric: &str,
    timestamp: Option<i64>,
    value: f64,
    tags: Vec<(String, String)>,
    ident_keys: &[String],
) -> Result<RawSample, DecodeError> {
    if metric.is_empty() {
        return Err(DecodeError::record(index, "empty metric name"));
    }
    let mut tags: Vec<(String, String)> = tags
        .into_iter()
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .map(|(k, v)| (sanitize_label_name(&k), v))
        .collect();
    let source = extract_ident(&mut tags, ident_keys);
    Ok(RawSample {
        name: sanitize_metric_name(metric),
        tags,
        points: vec![Point { timestamp, value }],
        source,
    })
}

/// Values above 1e12 are already milliseconds, smaller ones are seconds.
///
/// Zero and negative values are kept so the normalizer rejects them.
fn to_millis(timestamp: i64) -> i64 {
    if timestamp > MILLIS_TIMESTAMP_THRESHOLD {
        timestamp
    } else {
        timestamp.saturating_mul(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{Adapter, DecodePolicy, Protocol, RequestContext};

    fn keys() -> Vec<String> {
        vec!["ident".to_string(), "host".to_string()]
    }

    fn json_ctx() -> RequestContext {
        RequestContext::new(Some("application/json"), None)
    }

    #[test]
    fn test_parse_line() {
        let sample = parse_line(0, "put sys.cpu.user 1700000000 42.5 host=web01 cpu=0", &keys())
            .unwrap();
        assert_eq!(sample.name, "sys_cpu_user");
        assert_eq!(sample.source.as_deref(), Some("web01"));
        assert_eq!(
            sample.points,
            vec![Point {
                timestamp: Some(1_700_000_000_000),
                value: 42.5
            }]
        );
        assert_eq!(
            sample.tags,
            vec![
                ("ident".to_string(), "web01".to_string()),
                ("cpu".to_string(), "0".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_line_without_put_prefix() {
        let sample = parse_line(0, "load1 1700000000123 0.7", &keys()).unwrap();
        assert_eq!(sample.points[0].timestamp, Some(1_700_000_000_123));
        assert_eq!(sample.source, None);
    }

    #[test]
    fn test_parse_line_errors() {
        assert!(parse_line(0, "put", &keys()).is_err());
        assert!(parse_line(0, "put m 1700000000", &keys()).is_err());
        assert!(parse_line(0, "put m 1700000000 abc", &keys()).is_err());
        assert!(parse_line(0, "put m 1700000000 1 novalue", &keys()).is_err());
    }

    #[test]
    fn test_three_lines_one_bad() {
        let body = b"put a 1700000000 1 host=h\nput b 1700000000 x host=h\nput c 1700000000 3 host=h";
        let output = Adapter::new(Protocol::OpenTsdb)
            .decode(body, &RequestContext::default())
            .unwrap();
        let names: Vec<_> = output.samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(output.errors.len(), 1);
    }

    #[test]
    fn test_decode_json_array() {
        let body = br#"[
            {"metric":"mem.used","timestamp":1700000000,"value":"12","tags":{"host":"h1"}},
            {"metric":"mem.free","timestamp":0,"value":3,"tags":{"ident":"h2","slot":1}}
        ]"#;
        let output = Adapter::new(Protocol::OpenTsdb)
            .decode(body, &json_ctx())
            .unwrap();
        assert_eq!(output.samples.len(), 2);
        assert_eq!(output.samples[0].points[0].value, 12.0);
        assert_eq!(output.samples[0].source.as_deref(), Some("h1"));
        assert_eq!(output.samples[1].points[0].timestamp, Some(0));
        assert!(output
            .samples[1]
            .tags
            .contains(&("slot".to_string(), "1".to_string())));
    }

    #[test]
    fn test_decode_json_single_object_without_content_type() {
        let body = br#"{"metric":"up","timestamp":1700000000,"value":1}"#;
        let output = Adapter::new(Protocol::OpenTsdb)
            .decode(body, &RequestContext::default())
            .unwrap();
        assert_eq!(output.samples.len(), 1);
    }

    #[test]
    fn test_decode_json_bad_item_is_skipped() {
        let body = br#"[{"metric":"a","value":1},{"metric":"b","value":"nan?"}]"#;
        let output = Adapter::new(Protocol::OpenTsdb)
            .decode(body, &json_ctx())
            .unwrap();
        assert_eq!(output.samples.len(), 1);
        assert!(matches!(output.errors[0], DecodeError::Record { index: 1, .. }));
    }

    #[test]
    fn test_decode_json_syntax_error_is_fatal() {
        let result = Adapter::new(Protocol::OpenTsdb)
            .with_policy(DecodePolicy::BestEffort)
            .decode(b"[{\"metric\":", &json_ctx());
        assert!(matches!(result, Err(DecodeError::Json(_))));
    }

    #[test]
    fn test_to_millis() {
        assert_eq!(to_millis(0), 0);
        assert_eq!(to_millis(-5), -5_000);
        assert_eq!(to_millis(1_700_000_000), 1_700_000_000_000);
        assert_eq!(to_millis(1_700_000_000_000), 1_700_000_000_000);
    }

    #[test]
    fn test_zero_and_missing_timestamps() {
        let sample = parse_line(0, "put m 0 1 host=h", &keys()).unwrap();
        assert_eq!(sample.points[0].timestamp, Some(0));

        let body = br#"[{"metric":"a","value":1},{"metric":"b","timestamp":-3,"value":1}]"#;
        let output = Adapter::new(Protocol::OpenTsdb)
            .decode(body, &json_ctx())
            .unwrap();
        assert_eq!(output.samples[0].points[0].timestamp, None);
        assert_eq!(output.samples[1].points[0].timestamp, Some(-3_000));
    }
}
