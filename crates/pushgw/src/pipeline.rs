// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request-level orchestration: decode, normalize, dispatch.

use crate::adapters::{Adapter, DecodePolicy, Protocol, RequestContext};
use crate::constants::DEFAULT_MAX_REQUEST_BODY_BYTES;
use crate::dispatcher::{DispatchResult, Dispatcher, WriterStatus};
use crate::errors::{DecodeError, HeartbeatError};
use crate::heartbeat;
use crate::normalizer::Normalizer;
use crate::registry::{HeartbeatOutcome, IdentityRecord, Registry};
use crate::stats::{incr, Stats, StatsReport, StatsSnapshot};
use crate::util::now_millis;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Default)]
pub struct IngestReport {
    /// Samples handed to the dispatcher.
    pub accepted: usize,
    /// Records skipped by a best-effort decoder.
    pub decode_errors: Vec<DecodeError>,
    /// Points rejected by the normalizer.
    pub rejected: usize,
    pub dispatch: DispatchResult,
}

impl IngestReport {
    #[must_use]
    pub fn failed(&self) -> usize {
        self.decode_errors.len() + self.rejected
    }
}

pub struct Pipeline {
    /// One per protocol, at [`Protocol::index`].
    adapters: [Adapter; 4],
    normalizer: Normalizer,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<Registry>,
    stats: Arc<Stats>,
    ident_ttl: Duration,
    max_decoded_bytes: usize,
}

impl Pipeline {
    /// Builds a pipeline with every protocol at its default decode policy.
    pub fn new(
        normalizer: Normalizer,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<Registry>,
        stats: Arc<Stats>,
    ) -> Self {
        let ident_keys = normalizer.config().ident_label_keys.clone();
        let adapters = Protocol::ALL.map(|p| Adapter::new(p).with_ident_keys(ident_keys.clone()));
        Pipeline {
            adapters,
            normalizer,
            dispatcher,
            registry,
            stats,
            ident_ttl: Duration::from_secs(180),
            max_decoded_bytes: DEFAULT_MAX_REQUEST_BODY_BYTES,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, protocol: Protocol, policy: DecodePolicy) -> Self {
        self.adapters = self.adapters.map(|adapter| {
            if adapter.protocol() == protocol {
                adapter.with_policy(policy)
            } else {
                adapter
            }
        });
        self
    }

    /// Caps request bodies after decompression, heartbeats included.
    #[must_use]
    pub fn with_max_decoded_bytes(mut self, limit: usize) -> Self {
        self.adapters = self.adapters.map(|adapter| adapter.with_max_decoded_bytes(limit));
        self.max_decoded_bytes = limit;
        self
    }

    #[must_use]
    pub fn with_ident_ttl(mut self, ttl: Duration) -> Self {
        self.ident_ttl = ttl;
        self
    }

    #[must_use]
    pub fn ident_ttl(&self) -> Duration {
        self.ident_ttl
    }

    fn adapter(&self, protocol: Protocol) -> &Adapter {
        &self.adapters[protocol.index()]
    }

    pub fn ingest(
        &self,
        protocol: Protocol,
        body: &[u8],
        ctx: &RequestContext,
    ) -> Result<IngestReport, DecodeError> {
        self.ingest_at(protocol, body, ctx, now_millis())
    }

    /// Decodes, normalizes and dispatches one request body, with `now` as the ingestion time.
    ///
    /// A decode failure returns before anything reaches the dispatcher.
    pub fn ingest_at(
        &self,
        protocol: Protocol,
        body: &[u8],
        ctx: &RequestContext,
        now: i64,
    ) -> Result<IngestReport, DecodeError> {
        let decoded = self.adapter(protocol).decode(body, ctx).inspect_err(|_| {
            incr(&self.stats.decode_errors, 1);
        })?;
        incr(&self.stats.decode_errors, decoded.errors.len() as u64);

        let mut samples = Vec::new();
        let mut rejected = 0;
        for raw in decoded.samples {
            let output = self.normalizer.normalize(raw, now);
            rejected += output.rejected.len();
            samples.extend(output.samples);
        }
        let accepted = samples.len();
        let dispatch = self.dispatcher.dispatch(samples);
        incr(&self.stats.samples_forwarded, accepted as u64);
        debug!(
            "Ingested {accepted} {} samples ({} rejected, {} malformed records)",
            protocol.name(),
            rejected,
            decoded.errors.len()
        );
        Ok(IngestReport {
            accepted,
            decode_errors: decoded.errors,
            rejected,
            dispatch,
        })
    }

    /// Parses a heartbeat body and records it in the registry.
    pub fn heartbeat(
        &self,
        body: &[u8],
        content_encoding: Option<&str>,
        remote_addr: Option<&str>,
    ) -> Result<HeartbeatOutcome, HeartbeatError> {
        let skew_ms = i64::try_from(
            self.normalizer
                .config()
                .max_future_skew_secs
                .saturating_mul(1000),
        )
        .unwrap_or(i64::MAX);
        let heartbeat = heartbeat::parse(
            body,
            content_encoding,
            remote_addr,
            now_millis(),
            skew_ms,
            self.max_decoded_bytes,
        )?;
        let outcome =
            self.registry
                .heartbeat(&heartbeat.ident, heartbeat.metadata, heartbeat.timestamp)?;
        incr(&self.stats.heartbeats, 1);
        debug!("Heartbeat from {}: {outcome:?}", heartbeat.ident);
        Ok(outcome)
    }

    /// Identities with a heartbeat in the last `window`.
    #[must_use]
    pub fn active_targets(&self, window: Duration) -> Vec<IdentityRecord> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        self.registry
            .active_since(now_millis().saturating_sub(window_ms))
    }

    #[must_use]
    pub fn writer_statuses(&self) -> Vec<WriterStatus> {
        self.dispatcher.statuses()
    }

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn stats_report(&self) -> StatsReport {
        self.stats.report()
    }

    pub fn observe_request(&self, method: &str, route: &str, code: u16, elapsed: Duration) {
        self.stats.requests.observe(method, route, code, elapsed);
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}
