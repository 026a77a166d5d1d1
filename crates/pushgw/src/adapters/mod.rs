// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol decoders.
//!
//! Every adapter turns a request body into [`RawSample`]s and nothing else: no registry access,
//! no dispatch. Each protocol module yields one `Result` per record; [`Adapter::decode`] applies
//! the configured [`DecodePolicy`] to that list.

pub mod datadog;
pub mod falcon;
pub mod opentsdb;
pub mod remote_write;

use crate::constants::{DEFAULT_MAX_REQUEST_BODY_BYTES, HOST_LABEL, IDENT_LABEL};
use crate::errors::DecodeError;
use crate::sample::RawSample;
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::Read;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    RemoteWrite,
    OpenTsdb,
    Falcon,
    Datadog,
}

impl Protocol {
    pub const ALL: [Protocol; 4] = [
        Protocol::RemoteWrite,
        Protocol::OpenTsdb,
        Protocol::Falcon,
        Protocol::Datadog,
    ];

    /// Position in [`Protocol::ALL`].
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Protocol::RemoteWrite => 0,
            Protocol::OpenTsdb => 1,
            Protocol::Falcon => 2,
            Protocol::Datadog => 3,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Protocol::RemoteWrite => "remote_write",
            Protocol::OpenTsdb => "opentsdb",
            Protocol::Falcon => "falcon",
            Protocol::Datadog => "datadog",
        }
    }

    /// Binary and envelope-style protocols are all-or-nothing, line-style ones keep what parses.
    #[must_use]
    pub fn default_policy(self) -> DecodePolicy {
        match self {
            Protocol::RemoteWrite | Protocol::Datadog => DecodePolicy::Atomic,
            Protocol::OpenTsdb | Protocol::Falcon => DecodePolicy::BestEffort,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// The first malformed record fails the whole request.
    Atomic,
    /// Malformed records are logged and skipped.
    BestEffort,
}

/// Request headers the decoders care about.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl RequestContext {
    #[must_use]
    pub fn new(content_type: Option<&str>, content_encoding: Option<&str>) -> Self {
        RequestContext {
            content_type: content_type.map(str::to_string),
            content_encoding: content_encoding.map(str::to_string),
        }
    }

    fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct DecodeOutput {
    pub samples: Vec<RawSample>,
    /// Record-level errors skipped under [`DecodePolicy::BestEffort`].
    pub errors: Vec<DecodeError>,
}

#[derive(Debug, Clone)]
pub struct Adapter {
    protocol: Protocol,
    policy: DecodePolicy,
    ident_keys: Vec<String>,
    max_decoded_bytes: usize,
}

impl Adapter {
    #[must_use]
    pub fn new(protocol: Protocol) -> Self {
        Adapter {
            protocol,
            policy: protocol.default_policy(),
            ident_keys: vec![IDENT_LABEL.to_string(), HOST_LABEL.to_string()],
            max_decoded_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: DecodePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Tag keys searched, in order, for the agent identifier.
    #[must_use]
    pub fn with_ident_keys(mut self, keys: Vec<String>) -> Self {
        self.ident_keys = keys;
        self
    }

    /// Upper bound on a body after `Content-Encoding` is undone.
    #[must_use]
    pub fn with_max_decoded_bytes(mut self, limit: usize) -> Self {
        self.max_decoded_bytes = limit;
        self
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn policy(&self) -> DecodePolicy {
        self.policy
    }

    pub fn decode(&self, body: &[u8], ctx: &RequestContext) -> Result<DecodeOutput, DecodeError> {
        if body.is_empty() {
            return Err(DecodeError::Empty);
        }
        let encoding = match self.protocol {
            Protocol::RemoteWrite => ctx.content_encoding.as_deref().or(Some("snappy")),
            _ => ctx.content_encoding.as_deref(),
        };
        let body = decompress(body, encoding, self.max_decoded_bytes)?;
        let records = match self.protocol {
            Protocol::RemoteWrite => remote_write::decode(&body, &self.ident_keys)?,
            Protocol::OpenTsdb => opentsdb::decode(&body, ctx.is_json(), &self.ident_keys)?,
            Protocol::Falcon => falcon::decode(&body)?,
            Protocol::Datadog => datadog::decode(&body)?,
        };
        let output = collect(self.protocol, self.policy, records)?;
        debug!(
            "Decoded {} {} series ({} skipped)",
            output.samples.len(),
            self.protocol.name(),
            output.errors.len()
        );
        Ok(output)
    }
}

fn collect(
    protocol: Protocol,
    policy: DecodePolicy,
    records: Vec<Result<RawSample, DecodeError>>,
) -> Result<DecodeOutput, DecodeError> {
    let mut output = DecodeOutput::default();
    for record in records {
        match record {
            Ok(sample) => output.samples.push(sample),
            Err(e) if policy == DecodePolicy::Atomic => return Err(e),
            Err(e) => {
                warn!("Skipping malformed {} record: {e}", protocol.name());
                output.errors.push(e);
            }
        }
    }
    Ok(output)
}

/// Undoes the `Content-Encoding` of a body. `None` and `identity` leave it untouched.
///
/// Output larger than `limit` bytes fails with [`DecodeError::TooLarge`]; decoding stops as soon
/// as the limit is crossed.
pub fn decompress<'a>(
    body: &'a [u8],
    encoding: Option<&str>,
    limit: usize,
) -> Result<Cow<'a, [u8]>, DecodeError> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());
    let failed = |encoding: &str, reason: String| DecodeError::Decompress {
        encoding: encoding.to_string(),
        reason,
    };
    match encoding.as_deref() {
        None | Some("") | Some("identity") => {
            if body.len() > limit {
                return Err(DecodeError::TooLarge { limit });
            }
            Ok(Cow::Borrowed(body))
        }
        Some(enc @ "snappy") => {
            // The block format states its decoded length up front.
            let len = snap::raw::decompress_len(body).map_err(|e| failed(enc, e.to_string()))?;
            if len > limit {
                return Err(DecodeError::TooLarge { limit });
            }
            snap::raw::Decoder::new()
                .decompress_vec(body)
                .map(Cow::Owned)
                .map_err(|e| failed(enc, e.to_string()))
        }
        Some(enc @ "zstd") => {
            let decoder =
                zstd::stream::read::Decoder::new(body).map_err(|e| failed(enc, e.to_string()))?;
            read_limited(decoder, enc, limit).map(Cow::Owned)
        }
        Some(enc @ "gzip") => read_limited(GzDecoder::new(body), enc, limit).map(Cow::Owned),
        Some(enc @ ("deflate" | "zlib")) => {
            read_limited(ZlibDecoder::new(body), enc, limit).map(Cow::Owned)
        }
        Some(other) => Err(DecodeError::UnsupportedEncoding(other.to_string())),
    }
}

/// Reads at most `limit + 1` bytes so an oversized stream is detected without inflating it.
fn read_limited(reader: impl Read, encoding: &str, limit: usize) -> Result<Vec<u8>, DecodeError> {
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let mut out = Vec::new();
    reader
        .take(cap)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Decompress {
            encoding: encoding.to_string(),
            reason: e.to_string(),
        })?;
    if out.len() > limit {
        return Err(DecodeError::TooLarge { limit });
    }
    Ok(out)
}

/// Finds the agent identifier among `tags`, trying `keys` in order.
///
/// A match on the `host` key is renamed to `ident` so every attributed series carries the same
/// identifier label downstream.
pub(crate) fn extract_ident(tags: &mut [(String, String)], keys: &[String]) -> Option<String> {
    for key in keys {
        if let Some(tag) = tags.iter_mut().find(|(k, v)| k == key && !v.is_empty()) {
            if tag.0 == HOST_LABEL {
                tag.0 = IDENT_LABEL.to_string();
            }
            return Some(tag.1.clone());
        }
    }
    None
}

/// Sets the `ident` tag to `ident`, replacing an existing one.
pub(crate) fn set_ident_tag(tags: &mut Vec<(String, String)>, ident: &str) {
    tags.retain(|(k, _)| k != IDENT_LABEL);
    tags.push((IDENT_LABEL.to_string(), ident.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::{GzEncoder, ZlibEncoder};
    use flate2::Compression;
    use std::io::Write;

    const LIMIT: usize = DEFAULT_MAX_REQUEST_BODY_BYTES;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(data).unwrap();
        gz.finish().unwrap()
    }

    fn tags(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_policies() {
        assert_eq!(Protocol::RemoteWrite.default_policy(), DecodePolicy::Atomic);
        assert_eq!(Protocol::Datadog.default_policy(), DecodePolicy::Atomic);
        assert_eq!(Protocol::OpenTsdb.default_policy(), DecodePolicy::BestEffort);
        assert_eq!(Protocol::Falcon.default_policy(), DecodePolicy::BestEffort);
    }

    #[test]
    fn test_protocol_index_matches_all() {
        for (i, protocol) in Protocol::ALL.iter().enumerate() {
            assert_eq!(protocol.index(), i);
        }
    }

    #[test]
    fn test_decode_rejects_empty_body() {
        let adapter = Adapter::new(Protocol::OpenTsdb);
        assert_eq!(
            adapter.decode(b"", &RequestContext::default()),
            Err(DecodeError::Empty)
        );
    }

    #[test]
    fn test_best_effort_opentsdb_keeps_good_lines() {
        let body = b"put cpu.idle 1700000000 90 host=a\nput cpu.idle notatime 91 host=a\nput cpu.idle 1700000010 92 host=a\n";
        let output = Adapter::new(Protocol::OpenTsdb)
            .decode(body, &RequestContext::default())
            .unwrap();
        assert_eq!(output.samples.len(), 2);
        assert_eq!(output.errors.len(), 1);
        assert!(matches!(output.errors[0], DecodeError::Record { index: 1, .. }));
    }

    #[test]
    fn test_atomic_override_fails_on_first_bad_line() {
        let body = b"put cpu.idle 1700000000 90 host=a\nput cpu.idle notatime 91 host=a\n";
        let result = Adapter::new(Protocol::OpenTsdb)
            .with_policy(DecodePolicy::Atomic)
            .decode(body, &RequestContext::default());
        assert!(matches!(result, Err(DecodeError::Record { index: 1, .. })));
    }

    #[test]
    fn test_decompress_gzip_and_deflate() {
        assert_eq!(&*decompress(&gzip(b"hello"), Some("gzip"), LIMIT).unwrap(), b"hello");

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(b"hello").unwrap();
        let zlib = zlib.finish().unwrap();
        assert_eq!(&*decompress(&zlib, Some("deflate"), LIMIT).unwrap(), b"hello");
    }

    #[test]
    fn test_decompress_snappy_and_zstd() {
        let snappy = snap::raw::Encoder::new().compress_vec(b"payload").unwrap();
        assert_eq!(&*decompress(&snappy, Some("snappy"), LIMIT).unwrap(), b"payload");

        let zstd = zstd::encode_all(&b"payload"[..], 3).unwrap();
        assert_eq!(&*decompress(&zstd, Some("ZSTD"), LIMIT).unwrap(), b"payload");
    }

    #[test]
    fn test_decompress_errors() {
        assert_eq!(
            decompress(b"abc", Some("br"), LIMIT),
            Err(DecodeError::UnsupportedEncoding("br".to_string()))
        );
        assert!(matches!(
            decompress(b"not gzip", Some("gzip"), LIMIT),
            Err(DecodeError::Decompress { .. })
        ));
        assert_eq!(&*decompress(b"plain", None, LIMIT).unwrap(), b"plain");
    }

    #[test]
    fn test_decompression_bomb_is_rejected() {
        let zeros = vec![0u8; 1024 * 1024];
        let limit = 64 * 1024;
        let too_large = |encoded: &[u8], encoding: Option<&str>| {
            matches!(
                decompress(encoded, encoding, limit),
                Err(DecodeError::TooLarge { limit: l }) if l == limit
            )
        };

        let gz = gzip(&zeros);
        assert!(gz.len() < limit);
        assert!(too_large(&gz, Some("gzip")));

        let mut zlib = ZlibEncoder::new(Vec::new(), Compression::default());
        zlib.write_all(&zeros).unwrap();
        assert!(too_large(&zlib.finish().unwrap(), Some("deflate")));

        let zstd = zstd::encode_all(&zeros[..], 3).unwrap();
        assert!(too_large(&zstd, Some("zstd")));

        let snappy = snap::raw::Encoder::new().compress_vec(&zeros).unwrap();
        assert!(too_large(&snappy, Some("snappy")));

        assert!(too_large(&zeros, None));
        // Exactly at the limit is fine.
        assert_eq!(decompress(&gzip(&zeros[..limit]), Some("gzip"), limit).unwrap().len(), limit);
    }

    #[test]
    fn test_adapter_applies_decoded_size_limit() {
        let mut body = Vec::new();
        for i in 0..2_000 {
            body.extend_from_slice(format!("put cpu.idle 1700000000 {i} host=a\n").as_bytes());
        }
        let ctx = RequestContext::new(None, Some("gzip"));
        let adapter = Adapter::new(Protocol::OpenTsdb).with_max_decoded_bytes(1024);
        assert_eq!(
            adapter.decode(&gzip(&body), &ctx),
            Err(DecodeError::TooLarge { limit: 1024 })
        );
        let output = Adapter::new(Protocol::OpenTsdb)
            .decode(&gzip(&body), &ctx)
            .unwrap();
        assert_eq!(output.samples.len(), 2_000);
    }

    #[test]
    fn test_extract_ident_prefers_ident_then_host() {
        let keys = vec![IDENT_LABEL.to_string(), HOST_LABEL.to_string()];

        let mut t = tags(&[("host", "h1"), ("ident", "i1")]);
        assert_eq!(extract_ident(&mut t, &keys), Some("i1".to_string()));
        assert_eq!(t, tags(&[("host", "h1"), ("ident", "i1")]));

        let mut t = tags(&[("host", "h1"), ("env", "prod")]);
        assert_eq!(extract_ident(&mut t, &keys), Some("h1".to_string()));
        assert_eq!(t, tags(&[("ident", "h1"), ("env", "prod")]));

        let mut t = tags(&[("ident", ""), ("env", "prod")]);
        assert_eq!(extract_ident(&mut t, &keys), None);
    }
}
