// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Target and business group lookup used for attribution.
//!
//! The gateway does not own target metadata. [`TargetCache`] holds a snapshot loaded from a YAML
//! file and swapped wholesale on reload, so readers never see a half-applied update.

use crate::errors::TargetsError;
use fnv::FnvHasher;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::BuildHasherDefault;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusiGroup {
    pub id: i64,
    pub name: String,
    /// Whether samples of this group get the group label.
    #[serde(default)]
    pub label_enable: bool,
    #[serde(default)]
    pub label_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub ident: String,
    #[serde(default)]
    pub group_ids: Vec<i64>,
    /// Host tags appended to every sample of the target.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub host_ip: Option<String>,
}

/// Resolves an agent identifier to its target and owning business group.
pub trait TargetLookup: Send + Sync {
    fn resolve(&self, ident: &str) -> Option<(TargetInfo, Option<BusiGroup>)>;
}

/// Lookup that knows no target.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTargets;

impl TargetLookup for NoTargets {
    fn resolve(&self, _ident: &str) -> Option<(TargetInfo, Option<BusiGroup>)> {
        None
    }
}

#[derive(Debug, Default, Deserialize)]
struct TargetsFile {
    #[serde(default)]
    targets: Vec<TargetInfo>,
    #[serde(default)]
    busi_groups: Vec<BusiGroup>,
}

type FnvMap<K, V> = HashMap<K, V, BuildHasherDefault<FnvHasher>>;

#[derive(Debug, Default)]
struct Snapshot {
    targets: FnvMap<String, TargetInfo>,
    groups: FnvMap<i64, BusiGroup>,
}

#[derive(Debug, Default)]
pub struct TargetCache {
    snapshot: RwLock<Arc<Snapshot>>,
    path: Option<PathBuf>,
}

impl TargetCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the cache from a YAML file with `targets` and `busi_groups` lists.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TargetsError> {
        let cache = TargetCache {
            snapshot: RwLock::default(),
            path: Some(path.as_ref().to_path_buf()),
        };
        cache.reload()?;
        Ok(cache)
    }

    /// Swaps in a new set of targets and groups.
    pub fn replace(&self, targets: Vec<TargetInfo>, groups: Vec<BusiGroup>) {
        let snapshot = Snapshot {
            targets: targets.into_iter().map(|t| (t.ident.clone(), t)).collect(),
            groups: groups.into_iter().map(|g| (g.id, g)).collect(),
        };
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// Re-reads the backing file. Without a file this is a no-op. On error the previous
    /// snapshot stays in place.
    pub fn reload(&self) -> Result<(), TargetsError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| TargetsError::Io {
            path: display.clone(),
            source,
        })?;
        let file: TargetsFile = serde_yaml::from_str(&raw).map_err(|e| TargetsError::Parse {
            path: display,
            reason: e.to_string(),
        })?;
        let (targets, groups) = (file.targets.len(), file.busi_groups.len());
        self.replace(file.targets, file.busi_groups);
        debug!("Loaded {targets} targets and {groups} business groups");
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot.read().targets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TargetLookup for TargetCache {
    fn resolve(&self, ident: &str) -> Option<(TargetInfo, Option<BusiGroup>)> {
        let snapshot = Arc::clone(&*self.snapshot.read());
        let target = snapshot.targets.get(ident)?.clone();
        let group = target
            .group_ids
            .iter()
            .find_map(|id| snapshot.groups.get(id))
            .cloned();
        Some((target, group))
    }
}

/// Reloads `cache` every `interval` until `cancel` fires. Failed reloads are logged and the
/// previous snapshot is kept.
pub async fn run_reloader(cache: Arc<TargetCache>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately and the cache was loaded at startup.
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Target reloader stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = cache.reload() {
                    error!("Failed to reload targets: {e}");
                }
            }
        }
    }
}
