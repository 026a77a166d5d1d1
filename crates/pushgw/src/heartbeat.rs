// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Agent heartbeat payloads.
//!
//! Agents post their host metadata as a JSON object. `hostname` is the identifier, every field is
//! kept as opaque metadata.

use crate::adapters::decompress;
use crate::errors::DecodeError;
use serde_json::{Map, Value};

pub const HOSTNAME_FIELD: &str = "hostname";
pub const UNIX_TIME_FIELD: &str = "unix_time";
pub const REMOTE_ADDR_FIELD: &str = "remote_addr";

#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub ident: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub metadata: Map<String, Value>,
}

/// Parses a heartbeat body.
///
/// The agent-reported `unix_time` (ms) is used as the heartbeat time when it is within
/// `max_skew_ms` of `now`, otherwise the heartbeat is stamped with `now`. A missing `hostname`
/// yields an empty identifier, which the registry rejects.
pub fn parse(
    body: &[u8],
    content_encoding: Option<&str>,
    remote_addr: Option<&str>,
    now: i64,
    max_skew_ms: i64,
    max_decoded_bytes: usize,
) -> Result<Heartbeat, DecodeError> {
    if body.is_empty() {
        return Err(DecodeError::Empty);
    }
    let body = decompress(body, content_encoding, max_decoded_bytes)?;
    let mut metadata = match serde_json::from_slice::<Value>(&body)
        .map_err(|e| DecodeError::Json(e.to_string()))?
    {
        Value::Object(map) => map,
        _ => return Err(DecodeError::Json("expected a JSON object".to_string())),
    };

    let ident = metadata
        .get(HOSTNAME_FIELD)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let timestamp = metadata
        .get(UNIX_TIME_FIELD)
        .and_then(Value::as_i64)
        .filter(|ts| *ts > 0 && ts.abs_diff(now) <= max_skew_ms.unsigned_abs())
        .unwrap_or(now);
    if let Some(addr) = remote_addr.filter(|a| !a.is_empty()) {
        metadata.insert(REMOTE_ADDR_FIELD.to_string(), Value::String(addr.to_string()));
    }

    Ok(Heartbeat {
        ident,
        timestamp,
        metadata,
    })
}

/// Client address from `X-Real-IP`, else the first `X-Forwarded-For` hop.
#[must_use]
pub fn remote_addr(real_ip: Option<&str>, forwarded_for: Option<&str>) -> Option<String> {
    real_ip
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            forwarded_for
                .and_then(|f| f.split(',').next())
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
        })
        .map(str::to_string)
}
