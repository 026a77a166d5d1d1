// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{BUSIGROUP_LABEL, HOST_LABEL, IDENT_LABEL};
use crate::errors::NormalizeError;
use crate::registry::Registry;
use crate::relabel::RelabelHook;
use crate::sample::{CanonicalSample, Labels, RawSample};
use crate::stats::{incr, Stats};
use crate::targets::{BusiGroup, TargetLookup};
use crate::util::sanitize_label_name;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// How far ahead of the gateway clock a timestamp may be.
    pub max_future_skew_secs: u64,
    /// Append the host tags of a known target to its samples.
    pub append_target_tags: bool,
    pub busigroup_label_key: String,
    /// Tag keys searched, in order, for the agent identifier.
    pub ident_label_keys: Vec<String>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        NormalizerConfig {
            max_future_skew_secs: 600,
            append_target_tags: true,
            busigroup_label_key: BUSIGROUP_LABEL.to_string(),
            ident_label_keys: vec![IDENT_LABEL.to_string(), HOST_LABEL.to_string()],
        }
    }
}

#[derive(Debug, Default)]
pub struct NormalizeOutput {
    pub samples: Vec<CanonicalSample>,
    pub rejected: Vec<NormalizeError>,
}

pub struct Normalizer {
    registry: Arc<Registry>,
    targets: Arc<dyn TargetLookup>,
    hook: Option<Arc<dyn RelabelHook>>,
    config: NormalizerConfig,
    stats: Arc<Stats>,
}

impl Normalizer {
    pub fn new(
        registry: Arc<Registry>,
        targets: Arc<dyn TargetLookup>,
        hook: Option<Arc<dyn RelabelHook>>,
        config: NormalizerConfig,
        stats: Arc<Stats>,
    ) -> Self {
        Normalizer {
            registry,
            targets,
            hook,
            config,
            stats,
        }
    }

    #[must_use]
    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Turns one raw series into canonical samples, one per point.
    ///
    /// Points with an unacceptable timestamp are rejected individually; the rest of the series
    /// goes through.
    pub fn normalize(&self, raw: RawSample, now: i64) -> NormalizeOutput {
        let mut output = NormalizeOutput::default();
        incr(&self.stats.samples_received, raw.points.len() as u64);

        let skew_ms = i64::try_from(self.config.max_future_skew_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX);
        let (target, labels, busi_group) = self.attribute(&raw);
        if target.is_none() {
            incr(&self.stats.unattributed_samples, raw.points.len() as u64);
        }

        for point in &raw.points {
            let timestamp = point.timestamp.unwrap_or(now);
            if timestamp <= 0 || timestamp > now.saturating_add(skew_ms) {
                incr(&self.stats.clock_skew_rejected, 1);
                debug!("Rejecting {} point at {timestamp}: clock skew", raw.name);
                output.rejected.push(NormalizeError::ClockSkew {
                    metric: raw.name.clone(),
                    timestamp,
                    now,
                });
                continue;
            }
            let sample = CanonicalSample {
                name: raw.name.clone(),
                labels: labels.clone(),
                timestamp,
                value: point.value,
                target: target.clone(),
                busi_group: busi_group.clone(),
            };
            let Some(sample) = self.run_hook(sample) else {
                incr(&self.stats.relabel_dropped, 1);
                continue;
            };
            if sample.name.is_empty() {
                incr(&self.stats.relabel_dropped, 1);
                debug!("Dropping sample left without a metric name after relabeling");
                continue;
            }
            output.samples.push(sample);
        }
        output
    }

    fn attribute(&self, raw: &RawSample) -> (Option<String>, Labels, Option<BusiGroup>) {
        let mut labels = Labels::from_pairs(raw.tags.iter().cloned());
        let Some(ident) = raw.source.as_deref() else {
            return (None, labels, None);
        };
        let resolved = self.targets.resolve(ident);
        if resolved.is_none() && !self.registry.contains(ident) {
            return (None, labels, None);
        }

        let mut busi_group = None;
        if let Some((info, group)) = resolved {
            if self.config.append_target_tags {
                for (k, v) in &info.tags {
                    labels.insert_if_absent(sanitize_label_name(k), v.as_str());
                }
            }
            if let Some(group) = &group {
                if group.label_enable && !group.label_value.is_empty() {
                    labels.insert(
                        self.config.busigroup_label_key.as_str(),
                        group.label_value.as_str(),
                    );
                }
            }
            busi_group = group;
        }
        (Some(ident.to_string()), labels, busi_group)
    }

    /// Runs the hook on a copy of the sample. A panicking hook lets the original through.
    fn run_hook(&self, sample: CanonicalSample) -> Option<CanonicalSample> {
        let Some(hook) = &self.hook else {
            return Some(sample);
        };
        let candidate = sample.clone();
        match catch_unwind(AssertUnwindSafe(|| hook.apply(candidate))) {
            Ok(result) => result,
            Err(_) => {
                incr(&self.stats.hook_faults, 1);
                warn!(
                    "Relabel hook panicked on {}, forwarding sample unmodified",
                    sample.name
                );
                Some(sample)
            }
        }
    }
}
