// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Identity registry fed by agent heartbeats.
//!
//! Records are spread over [`REGISTRY_SHARDS`] independently locked maps keyed by the FNV hash of
//! the identifier. A heartbeat only takes the write lock of its own shard, and enrichment only
//! takes read locks.

use crate::constants::{MAX_IDENT_LEN, REGISTRY_SHARDS};
use crate::errors::IdentityError;
use fnv::FnvHasher;
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::hash::{BuildHasherDefault, Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type Shard = RwLock<HashMap<String, IdentityRecord, BuildHasherDefault<FnvHasher>>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityRecord {
    pub ident: String,
    /// Milliseconds since the Unix epoch.
    pub last_heartbeat: i64,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Inserted,
    Updated,
    /// An equal or newer heartbeat was already recorded and the record is unchanged. Equal
    /// timestamps are never stale.
    Stale,
}

pub struct Registry {
    shards: Vec<Shard>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Registry {
            shards: (0..REGISTRY_SHARDS)
                .map(|_| RwLock::new(HashMap::default()))
                .collect(),
        }
    }

    fn shard(&self, ident: &str) -> &Shard {
        let mut hasher = FnvHasher::default();
        ident.hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Records a heartbeat observed at `now` (ms).
    ///
    /// The record with the higher timestamp wins; on equal timestamps the heartbeat processed
    /// last wins.
    pub fn heartbeat(
        &self,
        ident: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
        now: i64,
    ) -> Result<HeartbeatOutcome, IdentityError> {
        validate_ident(ident)?;
        let mut shard = self.shard(ident).write();
        match shard.get_mut(ident) {
            Some(record) if record.last_heartbeat > now => {
                debug!(
                    "Ignoring stale heartbeat for {ident}: {now} < {}",
                    record.last_heartbeat
                );
                Ok(HeartbeatOutcome::Stale)
            }
            Some(record) => {
                record.last_heartbeat = now;
                record.metadata = metadata;
                Ok(HeartbeatOutcome::Updated)
            }
            None => {
                shard.insert(
                    ident.to_string(),
                    IdentityRecord {
                        ident: ident.to_string(),
                        last_heartbeat: now,
                        metadata,
                    },
                );
                Ok(HeartbeatOutcome::Inserted)
            }
        }
    }

    #[must_use]
    pub fn lookup(&self, ident: &str) -> Option<IdentityRecord> {
        self.shard(ident).read().get(ident).cloned()
    }

    #[must_use]
    pub fn contains(&self, ident: &str) -> bool {
        self.shard(ident).read().contains_key(ident)
    }

    /// Records whose last heartbeat is at or after `cutoff`, sorted by identifier.
    #[must_use]
    pub fn active_since(&self, cutoff: i64) -> Vec<IdentityRecord> {
        let mut active: Vec<IdentityRecord> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .values()
                    .filter(|r| r.last_heartbeat >= cutoff)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        active.sort_unstable_by(|a, b| a.ident.cmp(&b.ident));
        active
    }

    /// Removes every record with `last_heartbeat < now - ttl` and returns how many were removed.
    pub fn sweep(&self, now: i64, ttl: Duration) -> usize {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(ttl_ms);
        self.shards
            .iter()
            .map(|shard| {
                let mut shard = shard.write();
                let before = shard.len();
                shard.retain(|_, r| r.last_heartbeat >= cutoff);
                before - shard.len()
            })
            .sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }
}

fn validate_ident(ident: &str) -> Result<(), IdentityError> {
    let reason = if ident.is_empty() {
        "identifier is empty"
    } else if ident.len() > MAX_IDENT_LEN {
        "identifier is too long"
    } else if ident.chars().any(|c| c.is_whitespace() || c.is_control()) {
        "identifier contains whitespace or control characters"
    } else {
        return Ok(());
    };
    Err(IdentityError::InvalidIdentity {
        ident: ident.to_string(),
        reason,
    })
}

/// Sweeps `registry` every `interval` until `cancel` fires.
pub async fn run_sweeper(
    registry: Arc<Registry>,
    ttl: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Identity sweeper stopped");
                return;
            }
            _ = ticker.tick() => {
                let removed = registry.sweep(crate::util::now_millis(), ttl);
                if removed > 0 {
                    info!("Evicted {removed} identities without a heartbeat in {}s", ttl.as_secs());
                }
            }
        }
    }
}
