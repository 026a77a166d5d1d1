// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use fnv::FnvHasher;
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bounds, in seconds, of the request duration buckets.
pub const REQUEST_DURATION_BUCKETS: [f64; 11] =
    [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Pipeline counters, shared by `Arc` between the request handlers and the normalizer.
#[derive(Debug, Default)]
pub struct Stats {
    pub samples_received: AtomicU64,
    pub samples_forwarded: AtomicU64,
    pub decode_errors: AtomicU64,
    pub clock_skew_rejected: AtomicU64,
    pub hook_faults: AtomicU64,
    pub relabel_dropped: AtomicU64,
    pub heartbeats: AtomicU64,
    pub unattributed_samples: AtomicU64,
    pub requests: RequestStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub samples_received: u64,
    pub samples_forwarded: u64,
    pub decode_errors: u64,
    pub clock_skew_rejected: u64,
    pub hook_faults: u64,
    pub relabel_dropped: u64,
    pub heartbeats: u64,
    pub unattributed_samples: u64,
}

/// Counters plus the per-route request durations, as served on the stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub counters: StatsSnapshot,
    pub requests: Vec<RouteStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    method: String,
    route: String,
    code: u16,
}

#[derive(Debug, Default)]
struct DurationHistogram {
    count: u64,
    sum_secs: f64,
    /// Per-bucket counts, not cumulative. Observations above the last bound only count in
    /// `count`.
    buckets: [u64; REQUEST_DURATION_BUCKETS.len()],
}

impl DurationHistogram {
    fn observe(&mut self, secs: f64) {
        self.count += 1;
        self.sum_secs += secs;
        if let Some(i) = REQUEST_DURATION_BUCKETS.iter().position(|le| secs <= *le) {
            self.buckets[i] += 1;
        }
    }
}

/// Request count and duration histogram per method, matched route and status code.
#[derive(Debug, Default)]
pub struct RequestStats {
    routes: Mutex<HashMap<RouteKey, DurationHistogram, BuildHasherDefault<FnvHasher>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteStats {
    pub method: String,
    pub route: String,
    pub code: u16,
    pub count: u64,
    pub sum_secs: f64,
    pub buckets: Vec<DurationBucket>,
}

/// Cumulative count of requests that took at most `le` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DurationBucket {
    pub le: f64,
    pub count: u64,
}

impl RequestStats {
    pub fn observe(&self, method: &str, route: &str, code: u16, elapsed: Duration) {
        let key = RouteKey {
            method: method.to_string(),
            route: route.to_string(),
            code,
        };
        self.routes
            .lock()
            .entry(key)
            .or_default()
            .observe(elapsed.as_secs_f64());
    }

    /// Sorted by route, method and status code.
    #[must_use]
    pub fn snapshot(&self) -> Vec<RouteStats> {
        let mut routes: Vec<RouteStats> = self
            .routes
            .lock()
            .iter()
            .map(|(key, histogram)| {
                let mut cumulative = 0;
                let buckets = REQUEST_DURATION_BUCKETS
                    .iter()
                    .zip(histogram.buckets)
                    .map(|(le, n)| {
                        cumulative += n;
                        DurationBucket {
                            le: *le,
                            count: cumulative,
                        }
                    })
                    .collect();
                RouteStats {
                    method: key.method.clone(),
                    route: key.route.clone(),
                    code: key.code,
                    count: histogram.count,
                    sum_secs: histogram.sum_secs,
                    buckets,
                }
            })
            .collect();
        routes.sort_by(|a, b| {
            (&a.route, &a.method, a.code).cmp(&(&b.route, &b.method, b.code))
        });
        routes
    }
}

pub(crate) fn incr(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl Stats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            samples_received: load(&self.samples_received),
            samples_forwarded: load(&self.samples_forwarded),
            decode_errors: load(&self.decode_errors),
            clock_skew_rejected: load(&self.clock_skew_rejected),
            hook_faults: load(&self.hook_faults),
            relabel_dropped: load(&self.relabel_dropped),
            heartbeats: load(&self.heartbeats),
            unattributed_samples: load(&self.unattributed_samples),
        }
    }

    #[must_use]
    pub fn report(&self) -> StatsReport {
        StatsReport {
            counters: self.snapshot(),
            requests: self.requests.snapshot(),
        }
    }
}
