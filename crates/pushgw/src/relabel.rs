// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus-style relabeling.
//!
//! Rules see the metric name as the `__name__` label, so they can rename or filter on it like
//! any other label. Regexes are anchored on both ends.

use crate::constants::METRIC_NAME_LABEL;
use crate::errors::RelabelError;
use crate::sample::{CanonicalSample, Labels};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Hook applied to every sample after attribution. Returning `None` drops the sample.
pub trait RelabelHook: Send + Sync {
    fn apply(&self, sample: CanonicalSample) -> Option<CanonicalSample>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelabelAction {
    #[default]
    Replace,
    Keep,
    Drop,
    LabelDrop,
    LabelKeep,
    LabelMap,
}

impl RelabelAction {
    fn name(self) -> &'static str {
        match self {
            RelabelAction::Replace => "replace",
            RelabelAction::Keep => "keep",
            RelabelAction::Drop => "drop",
            RelabelAction::LabelDrop => "labeldrop",
            RelabelAction::LabelKeep => "labelkeep",
            RelabelAction::LabelMap => "labelmap",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelabelConfig {
    pub source_labels: Vec<String>,
    pub separator: String,
    pub regex: String,
    pub target_label: Option<String>,
    pub replacement: String,
    pub action: RelabelAction,
}

impl Default for RelabelConfig {
    fn default() -> Self {
        RelabelConfig {
            source_labels: Vec::new(),
            separator: ";".to_string(),
            regex: "(.*)".to_string(),
            target_label: None,
            replacement: "$1".to_string(),
            action: RelabelAction::Replace,
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    source_labels: Vec<String>,
    separator: String,
    regex: Regex,
    target_label: String,
    replacement: String,
    action: RelabelAction,
}

impl Rule {
    fn compile(config: &RelabelConfig) -> Result<Self, RelabelError> {
        let regex = Regex::new(&format!("^(?:{})$", config.regex)).map_err(|e| {
            RelabelError::Regex {
                regex: config.regex.clone(),
                reason: e.to_string(),
            }
        })?;
        let target_label = config.target_label.clone().unwrap_or_default();
        match config.action {
            RelabelAction::Replace if target_label.is_empty() => {
                return Err(RelabelError::MissingField {
                    action: config.action.name(),
                    field: "target_label",
                })
            }
            RelabelAction::Keep | RelabelAction::Drop if config.source_labels.is_empty() => {
                return Err(RelabelError::MissingField {
                    action: config.action.name(),
                    field: "source_labels",
                })
            }
            _ => {}
        }
        Ok(Rule {
            source_labels: config.source_labels.clone(),
            separator: config.separator.clone(),
            regex,
            target_label,
            replacement: config.replacement.clone(),
            action: config.action,
        })
    }

    fn source_value(&self, labels: &Labels) -> String {
        self.source_labels
            .iter()
            .map(|name| labels.get(name).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(&self.separator)
    }

    /// Applies the rule in place. Returns `false` when the series must be dropped.
    fn apply(&self, labels: &mut Labels) -> bool {
        match self.action {
            RelabelAction::Keep => self.regex.is_match(&self.source_value(labels)),
            RelabelAction::Drop => !self.regex.is_match(&self.source_value(labels)),
            RelabelAction::Replace => {
                let value = self.source_value(labels);
                if let Some(captures) = self.regex.captures(&value) {
                    let mut target = String::new();
                    captures.expand(&self.target_label, &mut target);
                    let mut replaced = String::new();
                    captures.expand(&self.replacement, &mut replaced);
                    if replaced.is_empty() {
                        labels.remove(&target);
                    } else if !target.is_empty() {
                        labels.insert(target, replaced);
                    }
                }
                true
            }
            RelabelAction::LabelDrop => {
                labels.retain(|name, _| name == METRIC_NAME_LABEL || !self.regex.is_match(name));
                true
            }
            RelabelAction::LabelKeep => {
                labels.retain(|name, _| name == METRIC_NAME_LABEL || self.regex.is_match(name));
                true
            }
            RelabelAction::LabelMap => {
                let mapped: Vec<(String, String)> = labels
                    .iter()
                    .filter_map(|(name, value)| {
                        let captures = self.regex.captures(name)?;
                        let mut renamed = String::new();
                        captures.expand(&self.replacement, &mut renamed);
                        (!renamed.is_empty()).then(|| (renamed, value.to_string()))
                    })
                    .collect();
                for (name, value) in mapped {
                    labels.insert(name, value);
                }
                true
            }
        }
    }
}

/// A compiled list of relabel rules, applied in order.
#[derive(Debug, Clone, Default)]
pub struct Relabeler {
    rules: Vec<Rule>,
}

impl Relabeler {
    pub fn new(configs: &[RelabelConfig]) -> Result<Self, RelabelError> {
        let rules = configs.iter().map(Rule::compile).collect::<Result<_, _>>()?;
        Ok(Relabeler { rules })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Runs every rule over the sample. `None` means a `keep` or `drop` rule filtered it out.
    ///
    /// Removing `__name__` leaves the sample with an empty name.
    #[must_use]
    pub fn process(&self, mut sample: CanonicalSample) -> Option<CanonicalSample> {
        if self.rules.is_empty() {
            return Some(sample);
        }
        let mut labels = Labels::new();
        labels.insert(METRIC_NAME_LABEL, std::mem::take(&mut sample.name));
        for (k, v) in sample.labels.iter() {
            labels.insert(k, v);
        }
        for rule in &self.rules {
            if !rule.apply(&mut labels) {
                return None;
            }
        }
        sample.name = labels.remove(METRIC_NAME_LABEL).unwrap_or_default();
        sample.labels = labels;
        Some(sample)
    }
}

impl RelabelHook for Relabeler {
    fn apply(&self, sample: CanonicalSample) -> Option<CanonicalSample> {
        self.process(sample)
    }
}
