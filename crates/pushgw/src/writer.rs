// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Downstream writers.

use crate::constants::METRIC_NAME_LABEL;
use crate::errors::{ConfigError, WriteError};
use crate::http_utils::build_client;
use crate::prompb::{Label, Sample, TimeSeries, WriteRequest};
use crate::relabel::RelabelConfig;
use crate::sample::CanonicalSample;
use async_trait::async_trait;
use parking_lot::Mutex;
use prost::Message;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// A downstream sink.
///
/// Errors classified [`WriteError::Permanent`] are never retried; anything else is.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(&self, batch: &[CanonicalSample]) -> Result<(), WriteError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub name: String,
    /// Remote-write endpoint, e.g. `http://prometheus:9090/api/v1/write`.
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub basic_auth_user: Option<String>,
    pub basic_auth_pass: Option<String>,
    pub timeout_ms: u64,
    /// Relabel rules applied by this writer only.
    pub write_relabels: Vec<RelabelConfig>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            name: String::new(),
            url: String::new(),
            headers: BTreeMap::new(),
            basic_auth_user: None,
            basic_auth_pass: None,
            timeout_ms: 10_000,
            write_relabels: Vec::new(),
        }
    }
}

/// Prometheus remote-write over HTTP.
#[derive(Debug, Clone)]
pub struct RemoteWriteWriter {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    basic_auth: Option<(String, Option<String>)>,
}

impl RemoteWriteWriter {
    pub fn from_config(config: &WriterConfig) -> Result<Self, ConfigError> {
        let client = build_client(Duration::from_millis(config.timeout_ms)).map_err(|e| {
            ConfigError::Invalid(format!("writer {}: failed to build client: {e}", config.name))
        })?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("snappy"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-protobuf"));
        headers.insert(
            HeaderName::from_static("x-prometheus-remote-write-version"),
            HeaderValue::from_static("0.1.0"),
        );
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ConfigError::Invalid(format!("writer {}: header {name}: {e}", config.name))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                ConfigError::Invalid(format!("writer {}: header {name}: {e}", config.name))
            })?;
            headers.insert(name, value);
        }
        Ok(RemoteWriteWriter {
            client,
            url: config.url.clone(),
            headers,
            basic_auth: config
                .basic_auth_user
                .clone()
                .map(|user| (user, config.basic_auth_pass.clone())),
        })
    }

    fn encode(batch: &[CanonicalSample]) -> Result<Vec<u8>, WriteError> {
        let request = WriteRequest {
            timeseries: batch.iter().map(to_timeseries).collect(),
        };
        snap::raw::Encoder::new()
            .compress_vec(&request.encode_to_vec())
            .map_err(|e| WriteError::Permanent(format!("failed to compress payload: {e}")))
    }
}

fn to_timeseries(sample: &CanonicalSample) -> TimeSeries {
    let mut labels: Vec<Label> = sample
        .labels
        .iter()
        .filter(|(name, _)| *name != METRIC_NAME_LABEL)
        .map(|(name, value)| Label {
            name: name.to_string(),
            value: value.to_string(),
        })
        .collect();
    labels.push(Label {
        name: METRIC_NAME_LABEL.to_string(),
        value: sample.name.clone(),
    });
    labels.sort_unstable_by(|a, b| a.name.cmp(&b.name));
    TimeSeries {
        labels,
        samples: vec![Sample {
            value: sample.value,
            timestamp: sample.timestamp,
        }],
    }
}

/// 4xx except 429 means the payload will never be accepted.
fn classify(status: StatusCode, body: &str) -> WriteError {
    let message = format!("{status}: {body}");
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        WriteError::Permanent(message)
    } else {
        WriteError::Transient(message)
    }
}

#[async_trait]
impl Writer for RemoteWriteWriter {
    async fn write(&self, batch: &[CanonicalSample]) -> Result<(), WriteError> {
        let body = Self::encode(batch)?;
        let mut request = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body);
        if let Some((user, pass)) = &self.basic_auth {
            request = request.basic_auth(user, pass.as_ref());
        }
        let response = request
            .send()
            .await
            .map_err(|e| WriteError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            debug!("Wrote {} samples to {}", batch.len(), self.url);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, &body))
    }
}

/// Keeps every batch in memory.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    batches: Mutex<Vec<Vec<CanonicalSample>>>,
}

impl MemoryWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn batches(&self) -> Vec<Vec<CanonicalSample>> {
        self.batches.lock().clone()
    }

    #[must_use]
    pub fn samples(&self) -> Vec<CanonicalSample> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Writer for MemoryWriter {
    async fn write(&self, batch: &[CanonicalSample]) -> Result<(), WriteError> {
        self.batches.lock().push(batch.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::Labels;
    use mockito::{Matcher, Server};

    fn sample(name: &str) -> CanonicalSample {
        CanonicalSample {
            name: name.to_string(),
            labels: Labels::from_pairs([("zone", "a"), ("ident", "host-1")]),
            timestamp: 1_700_000_000_000,
            value: 2.5,
            target: Some("host-1".to_string()),
            busi_group: None,
        }
    }

    fn writer(url: String) -> RemoteWriteWriter {
        RemoteWriteWriter::from_config(&WriterConfig {
            name: "prom".to_string(),
            url,
            headers: BTreeMap::from([("X-Scope-OrgID".to_string(), "tenant-1".to_string())]),
            basic_auth_user: Some("user".to_string()),
            basic_auth_pass: Some("pass".to_string()),
            ..WriterConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_timeseries_labels_are_sorted() {
        let series = to_timeseries(&sample("up"));
        let names: Vec<_> = series.labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["__name__", "ident", "zone"]);
        assert_eq!(series.samples[0].timestamp, 1_700_000_000_000);
    }

    #[test]
    fn test_encode_roundtrip() {
        let body = RemoteWriteWriter::encode(&[sample("up"), sample("down")]).unwrap();
        let raw = snap::raw::Decoder::new().decompress_vec(&body).unwrap();
        let request = WriteRequest::decode(raw.as_slice()).unwrap();
        assert_eq!(request.timeseries.len(), 2);
        assert_eq!(request.timeseries[1].labels[0].value, "down");
    }

    #[test]
    fn test_classify() {
        assert!(classify(StatusCode::BAD_REQUEST, "").is_permanent());
        assert!(!classify(StatusCode::TOO_MANY_REQUESTS, "").is_permanent());
        assert!(!classify(StatusCode::SERVICE_UNAVAILABLE, "").is_permanent());
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let result = RemoteWriteWriter::from_config(&WriterConfig {
            name: "prom".to_string(),
            url: "http://localhost".to_string(),
            headers: BTreeMap::from([("bad header".to_string(), "v".to_string())]),
            ..WriterConfig::default()
        });
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_remote_write_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/write")
            .match_header("content-encoding", "snappy")
            .match_header("content-type", "application/x-protobuf")
            .match_header("x-prometheus-remote-write-version", "0.1.0")
            .match_header("x-scope-orgid", "tenant-1")
            .match_header("authorization", Matcher::Regex("^Basic ".to_string()))
            .with_status(204)
            .create_async()
            .await;

        let writer = writer(format!("{}/api/v1/write", server.url()));
        assert_eq!(writer.write(&[sample("up")]).await, Ok(()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_remote_write_error_classification() {
        let mut server = Server::new_async().await;
        let _bad = server
            .mock("POST", "/bad")
            .with_status(400)
            .with_body("out of order sample")
            .create_async()
            .await;
        let _down = server
            .mock("POST", "/down")
            .with_status(503)
            .create_async()
            .await;

        let result = writer(format!("{}/bad", server.url()))
            .write(&[sample("up")])
            .await;
        assert!(matches!(result, Err(WriteError::Permanent(msg)) if msg.contains("out of order")));

        let result = writer(format!("{}/down", server.url()))
            .write(&[sample("up")])
            .await;
        assert!(matches!(result, Err(WriteError::Transient(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let result = writer("http://127.0.0.1:1/api/v1/write".to_string())
            .write(&[sample("up")])
            .await;
        assert!(matches!(result, Err(WriteError::Transient(_))));
    }

    #[tokio::test]
    async fn test_memory_writer() {
        let writer = MemoryWriter::new();
        writer.write(&[sample("a")]).await.unwrap();
        writer.write(&[sample("b"), sample("c")]).await.unwrap();
        assert_eq!(writer.batches().len(), 2);
        assert_eq!(writer.samples().len(), 3);
    }
}
