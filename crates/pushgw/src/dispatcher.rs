// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fan-out of canonical samples to the configured writers.
//!
//! Every writer target owns a bounded FIFO of batches and a dedicated delivery worker. Enqueueing
//! never waits: a full queue evicts its oldest batch. A slow or failing writer therefore only ever
//! loses its own data and never holds up the request path or the other targets.

use crate::errors::WriteError;
use crate::relabel::Relabeler;
use crate::sample::CanonicalSample;
use crate::writer::Writer;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type Batch = Arc<Vec<CanonicalSample>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total delivery attempts per batch, the first one included.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// Delay after failed attempt number `attempt` (1-based): `initial * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Per-target queue capacity, in batches.
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub retry: RetryConfig,
    /// How long `shutdown` lets workers drain their queues.
    pub drain_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            queue_capacity: 1024,
            batch_size: 1000,
            retry: RetryConfig::default(),
            drain_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    /// The last delivery attempt failed or panicked.
    Degraded,
    /// The delivery worker task itself died. Nothing is delivered to this target anymore.
    Failed,
}

impl Health {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Health::Healthy,
            1 => Health::Degraded,
            _ => Health::Failed,
        }
    }
}

/// A writer and the per-writer relabel rules its worker applies before each write.
pub struct WriterSpec {
    pub name: String,
    pub writer: Arc<dyn Writer>,
    pub relabeler: Option<Relabeler>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriterStatus {
    pub name: String,
    pub health: Health,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped_overflow: u64,
    pub dropped_exhausted: u64,
    pub failed_attempts: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetDispatch {
    pub name: String,
    pub enqueued: usize,
    /// Older batches evicted to make room.
    pub dropped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchResult {
    pub batches: usize,
    pub samples: usize,
    pub per_target: Vec<TargetDispatch>,
}

impl DispatchResult {
    #[must_use]
    pub fn dropped_batches(&self) -> usize {
        self.per_target.iter().map(|t| t.dropped).sum()
    }
}

struct Target {
    name: String,
    writer: Arc<dyn Writer>,
    relabeler: Option<Relabeler>,
    queue: Mutex<VecDeque<Batch>>,
    capacity: usize,
    notify: Notify,
    health: AtomicU8,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_exhausted: AtomicU64,
    failed_attempts: AtomicU64,
}

impl Target {
    fn new(spec: WriterSpec, capacity: usize) -> Self {
        Target {
            name: spec.name,
            writer: spec.writer,
            relabeler: spec.relabeler,
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            health: AtomicU8::new(0),
            enqueued: AtomicU64::default(),
            delivered: AtomicU64::default(),
            dropped_overflow: AtomicU64::default(),
            dropped_exhausted: AtomicU64::default(),
            failed_attempts: AtomicU64::default(),
        }
    }

    /// Appends `batch`, evicting the oldest queued batches when full. Returns how many were
    /// evicted.
    fn offer(&self, batch: Batch) -> usize {
        let mut dropped = 0;
        {
            let mut queue = self.queue.lock();
            while queue.len() >= self.capacity {
                queue.pop_front();
                dropped += 1;
            }
            queue.push_back(batch);
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        if dropped > 0 {
            self.dropped_overflow
                .fetch_add(dropped as u64, Ordering::Relaxed);
            warn!(
                "Writer {} queue is full, dropped {dropped} oldest batch(es)",
                self.name
            );
        }
        self.notify.notify_one();
        dropped
    }

    fn pop(&self) -> Option<Batch> {
        self.queue.lock().pop_front()
    }

    fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::Relaxed))
    }

    /// `Failed` is terminal.
    fn set_health(&self, health: Health) {
        let _ = self
            .health
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                (Health::from_u8(current) != Health::Failed).then_some(health as u8)
            });
    }

    fn status(&self) -> WriterStatus {
        WriterStatus {
            name: self.name.clone(),
            health: self.health(),
            queue_len: self.queue.lock().len(),
            queue_capacity: self.capacity,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_exhausted: self.dropped_exhausted.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
        }
    }
}

pub struct Dispatcher {
    targets: Vec<Arc<Target>>,
    batch_size: usize,
    drain_timeout: Duration,
    closing: CancellationToken,
    abort: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawns one delivery worker per writer. Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(specs: Vec<WriterSpec>, config: DispatcherConfig) -> Self {
        let closing = CancellationToken::new();
        let abort = CancellationToken::new();
        let capacity = config.queue_capacity.max(1);
        let targets: Vec<Arc<Target>> = specs
            .into_iter()
            .map(|spec| Arc::new(Target::new(spec, capacity)))
            .collect();
        let workers = targets
            .iter()
            .map(|target| {
                let worker = tokio::spawn(run_worker(
                    Arc::clone(target),
                    config.retry,
                    closing.clone(),
                    abort.clone(),
                ));
                tokio::spawn(watch_worker(Arc::clone(target), worker))
            })
            .collect();
        info!("Dispatcher started with {} writer(s)", targets.len());
        Dispatcher {
            targets,
            batch_size: config.batch_size.max(1),
            drain_timeout: Duration::from_secs(config.drain_timeout_secs),
            closing,
            abort,
            workers: Mutex::new(workers),
        }
    }

    /// Splits `samples` into batches and offers every batch to every target. Never waits.
    pub fn dispatch(&self, samples: Vec<CanonicalSample>) -> DispatchResult {
        let mut result = DispatchResult {
            batches: 0,
            samples: samples.len(),
            per_target: self
                .targets
                .iter()
                .map(|t| TargetDispatch {
                    name: t.name.clone(),
                    ..TargetDispatch::default()
                })
                .collect(),
        };
        let mut samples = samples.into_iter();
        loop {
            let batch: Vec<CanonicalSample> = samples.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                break;
            }
            result.batches += 1;
            let batch = Arc::new(batch);
            for (target, counts) in self.targets.iter().zip(result.per_target.iter_mut()) {
                counts.dropped += target.offer(Arc::clone(&batch));
                counts.enqueued += 1;
            }
        }
        result
    }

    #[must_use]
    pub fn statuses(&self) -> Vec<WriterStatus> {
        self.targets.iter().map(|t| t.status()).collect()
    }

    /// Lets the workers drain their queues, then stops them. Workers still busy after the drain
    /// timeout are interrupted and their remaining batches are lost.
    pub async fn shutdown(&self) {
        self.closing.cancel();
        let workers = std::mem::take(&mut *self.workers.lock());
        let drain = join_workers(workers);
        tokio::pin!(drain);
        if tokio::time::timeout(self.drain_timeout, &mut drain)
            .await
            .is_err()
        {
            warn!(
                "Writers did not drain within {}s, aborting delivery",
                self.drain_timeout.as_secs()
            );
            self.abort.cancel();
            drain.await;
        }
        info!("Dispatcher stopped");
    }
}

async fn join_workers(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

/// Marks the target failed when its worker task dies. Panicking writes are caught in `deliver`,
/// so this only covers faults outside the writer call.
async fn watch_worker(target: Arc<Target>, worker: JoinHandle<()>) {
    if let Err(e) = worker.await {
        if e.is_panic() {
            target.health.store(Health::Failed as u8, Ordering::Relaxed);
            error!("Writer {} worker panicked, target marked failed", target.name);
        }
    }
}

async fn run_worker(
    target: Arc<Target>,
    retry: RetryConfig,
    closing: CancellationToken,
    abort: CancellationToken,
) {
    debug!("Writer {} worker started", target.name);
    loop {
        if abort.is_cancelled() {
            break;
        }
        if let Some(batch) = target.pop() {
            deliver(&target, &batch, retry, &abort).await;
            continue;
        }
        if closing.is_cancelled() {
            break;
        }
        tokio::select! {
            () = target.notify.notified() => {}
            () = closing.cancelled() => {}
        }
    }
    debug!("Writer {} worker stopped", target.name);
}

async fn deliver(target: &Target, batch: &Batch, retry: RetryConfig, abort: &CancellationToken) {
    let relabeled;
    let samples: &[CanonicalSample] = match &target.relabeler {
        Some(relabeler) => {
            relabeled = batch
                .iter()
                .cloned()
                .filter_map(|s| relabeler.process(s))
                .filter(|s| !s.name.is_empty())
                .collect::<Vec<_>>();
            &relabeled
        }
        None => batch.as_slice(),
    };
    if samples.is_empty() {
        target.delivered.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let max_attempts = retry.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        let outcome = AssertUnwindSafe(target.writer.write(samples))
            .catch_unwind()
            .await;
        let error = match outcome {
            Ok(Ok(())) => {
                target.delivered.fetch_add(1, Ordering::Relaxed);
                target.set_health(Health::Healthy);
                return;
            }
            Ok(Err(e)) => e,
            Err(payload) => {
                error!(
                    "Writer {} panicked on attempt {attempt}: {}",
                    target.name,
                    panic_message(payload.as_ref())
                );
                WriteError::Transient("writer panicked".to_string())
            }
        };
        target.failed_attempts.fetch_add(1, Ordering::Relaxed);
        target.set_health(Health::Degraded);

        if error.is_permanent() || attempt == max_attempts {
            target.dropped_exhausted.fetch_add(1, Ordering::Relaxed);
            error!(
                "Writer {} dropped a batch of {} samples after {attempt} attempt(s): {error}",
                target.name,
                samples.len()
            );
            return;
        }

        let delay = retry.backoff(attempt);
        warn!(
            "Writer {} attempt {attempt}/{max_attempts} failed, retrying in {}ms: {error}",
            target.name,
            delay.as_millis()
        );
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = abort.cancelled() => {
                target.dropped_exhausted.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relabel::RelabelConfig;
    use crate::sample::Labels;
    use crate::writer::MemoryWriter;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Semaphore;

    fn sample(name: &str) -> CanonicalSample {
        CanonicalSample {
            name: name.to_string(),
            labels: Labels::from_pairs([("ident", "host-1")]),
            timestamp: 1_700_000_000_000,
            value: 1.0,
            target: None,
            busi_group: None,
        }
    }

    fn samples(n: usize) -> Vec<CanonicalSample> {
        (0..n).map(|i| sample(&format!("m{i}"))).collect()
    }

    fn config(queue_capacity: usize, batch_size: usize) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity,
            batch_size,
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
            drain_timeout_secs: 2,
        }
    }

    fn spec(name: &str, writer: Arc<dyn Writer>) -> WriterSpec {
        WriterSpec {
            name: name.to_string(),
            writer,
            relabeler: None,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Fails the first `failures` calls with the given error, then succeeds.
    struct FlakyWriter {
        failures: u32,
        permanent: bool,
        calls: AtomicU32,
        inner: MemoryWriter,
    }

    impl FlakyWriter {
        fn new(failures: u32, permanent: bool) -> Self {
            FlakyWriter {
                failures,
                permanent,
                calls: AtomicU32::new(0),
                inner: MemoryWriter::new(),
            }
        }
    }

    #[async_trait]
    impl Writer for FlakyWriter {
        async fn write(&self, batch: &[CanonicalSample]) -> Result<(), WriteError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.permanent {
                    WriteError::Permanent("rejected".to_string())
                } else {
                    WriteError::Transient("unavailable".to_string())
                });
            }
            self.inner.write(batch).await
        }
    }

    /// Blocks every write until a permit is released.
    struct GatedWriter {
        started: Notify,
        gate: Semaphore,
        inner: MemoryWriter,
    }

    #[async_trait]
    impl Writer for GatedWriter {
        async fn write(&self, batch: &[CanonicalSample]) -> Result<(), WriteError> {
            self.started.notify_one();
            self.gate.acquire().await.unwrap().forget();
            self.inner.write(batch).await
        }
    }

    /// Panics on the first `panics` calls, then delivers.
    struct PanickingWriter {
        panics: u32,
        calls: AtomicU32,
        inner: MemoryWriter,
    }

    impl PanickingWriter {
        fn new(panics: u32) -> Self {
            PanickingWriter {
                panics,
                calls: AtomicU32::new(0),
                inner: MemoryWriter::new(),
            }
        }
    }

    #[async_trait]
    impl Writer for PanickingWriter {
        async fn write(&self, batch: &[CanonicalSample]) -> Result<(), WriteError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.panics {
                panic!("backend bug on call {call}");
            }
            self.inner.write(batch).await
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(5), Duration::from_millis(1_000));
        assert_eq!(retry.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_panic_message() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let formatted: Box<dyn Any + Send> = Box::new(format!("boom {}", 2));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(formatted.as_ref()), "boom 2");
        assert_eq!(panic_message(other.as_ref()), "unknown panic payload");
    }

    #[test]
    fn test_offer_drops_oldest() {
        let target = Target::new(spec("t", Arc::new(MemoryWriter::new())), 2);
        assert_eq!(target.offer(Arc::new(samples(1))), 0);
        assert_eq!(target.offer(Arc::new(vec![sample("b")])), 0);
        assert_eq!(target.offer(Arc::new(vec![sample("c")])), 1);
        assert_eq!(target.pop().unwrap()[0].name, "b");
        assert_eq!(target.pop().unwrap()[0].name, "c");
        assert!(target.pop().is_none());
        assert_eq!(target.status().dropped_overflow, 1);
    }

    #[tokio::test]
    async fn test_fan_out_to_every_target() {
        let a = Arc::new(MemoryWriter::new());
        let b = Arc::new(MemoryWriter::new());
        let dispatcher = Dispatcher::start(
            vec![spec("a", a.clone()), spec("b", b.clone())],
            config(16, 2),
        );

        let result = dispatcher.dispatch(samples(3));
        assert_eq!(result.batches, 2);
        assert_eq!(result.samples, 3);
        assert_eq!(result.dropped_batches(), 0);
        assert_eq!(result.per_target[1].enqueued, 2);

        wait_until(|| a.samples().len() == 3 && b.samples().len() == 3).await;
        assert_eq!(a.batches().len(), 2);
        assert_eq!(a.samples(), b.samples());
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_and_keeps_order() {
        let gated = Arc::new(GatedWriter {
            started: Notify::new(),
            gate: Semaphore::new(0),
            inner: MemoryWriter::new(),
        });
        let dispatcher = Dispatcher::start(vec![spec("slow", gated.clone())], config(2, 1));

        dispatcher.dispatch(vec![sample("b1")]);
        gated.started.notified().await;

        let mut dropped = 0;
        for name in ["b2", "b3", "b4", "b5"] {
            dropped += dispatcher.dispatch(vec![sample(name)]).dropped_batches();
        }
        assert_eq!(dropped, 2);
        assert_eq!(dispatcher.statuses()[0].queue_len, 2);

        gated.gate.add_permits(10);
        wait_until(|| gated.inner.batches().len() == 3).await;
        let names: Vec<_> = gated.inner.samples().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["b1", "b4", "b5"]);
        assert_eq!(dispatcher.statuses()[0].dropped_overflow, 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_target_is_isolated() {
        let healthy = Arc::new(MemoryWriter::new());
        let broken = Arc::new(FlakyWriter::new(u32::MAX, false));
        let dispatcher = Dispatcher::start(
            vec![spec("broken", broken.clone()), spec("healthy", healthy.clone())],
            config(16, 10),
        );

        dispatcher.dispatch(samples(5));
        wait_until(|| dispatcher.statuses()[0].dropped_exhausted == 1).await;

        assert_eq!(healthy.samples().len(), 5);
        let statuses = dispatcher.statuses();
        assert_eq!(statuses[0].health, Health::Degraded);
        assert_eq!(statuses[0].failed_attempts, 3);
        assert_eq!(statuses[1].health, Health::Healthy);
        assert_eq!(statuses[1].delivered, 1);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_then_success_recovers() {
        let flaky = Arc::new(FlakyWriter::new(2, false));
        let dispatcher = Dispatcher::start(vec![spec("flaky", flaky.clone())], config(16, 10));

        dispatcher.dispatch(samples(2));
        wait_until(|| dispatcher.statuses()[0].delivered == 1).await;

        let status = &dispatcher.statuses()[0];
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.failed_attempts, 2);
        assert_eq!(status.dropped_exhausted, 0);
        assert_eq!(flaky.inner.samples().len(), 2);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let rejecting = Arc::new(FlakyWriter::new(1, true));
        let dispatcher =
            Dispatcher::start(vec![spec("rejecting", rejecting.clone())], config(16, 10));

        dispatcher.dispatch(samples(1));
        wait_until(|| dispatcher.statuses()[0].dropped_exhausted == 1).await;
        assert_eq!(rejecting.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.statuses()[0].health, Health::Degraded);

        // The next batch goes through and the target recovers.
        dispatcher.dispatch(samples(1));
        wait_until(|| dispatcher.statuses()[0].delivered == 1).await;
        assert_eq!(dispatcher.statuses()[0].health, Health::Healthy);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_write_is_a_failed_attempt() {
        let panicky = Arc::new(PanickingWriter::new(1));
        let healthy = Arc::new(MemoryWriter::new());
        let dispatcher = Dispatcher::start(
            vec![
                spec("panicky", panicky.clone()),
                spec("healthy", healthy.clone()),
            ],
            config(16, 10),
        );

        dispatcher.dispatch(samples(1));
        wait_until(|| dispatcher.statuses()[0].delivered == 1).await;
        let status = &dispatcher.statuses()[0];
        assert_eq!(status.failed_attempts, 1);
        assert_eq!(status.dropped_exhausted, 0);
        assert_eq!(status.health, Health::Healthy);

        for _ in 0..5 {
            dispatcher.dispatch(samples(1));
        }
        wait_until(|| dispatcher.statuses()[0].delivered == 6).await;
        assert_eq!(panicky.inner.batches().len(), 6);
        let status = &dispatcher.statuses()[0];
        assert_eq!(status.health, Health::Healthy);
        assert_eq!(status.queue_len, 0);
        dispatcher.shutdown().await;
        assert_eq!(healthy.batches().len(), 6);
    }

    #[tokio::test]
    async fn test_always_panicking_writer_degrades_but_keeps_draining() {
        let panicky = Arc::new(PanickingWriter::new(u32::MAX));
        let dispatcher = Dispatcher::start(vec![spec("panicky", panicky.clone())], config(16, 10));

        for _ in 0..3 {
            dispatcher.dispatch(samples(1));
        }
        wait_until(|| dispatcher.statuses()[0].dropped_exhausted == 3).await;
        let status = &dispatcher.statuses()[0];
        assert_eq!(status.health, Health::Degraded);
        assert_eq!(status.failed_attempts, 9);
        assert_eq!(status.queue_len, 0);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_write_relabels_apply_per_target() {
        let filtered = Arc::new(MemoryWriter::new());
        let untouched = Arc::new(MemoryWriter::new());
        let keep_m0: RelabelConfig =
            serde_yaml::from_str("action: keep\nsource_labels: [__name__]\nregex: m0").unwrap();
        let drop_all: RelabelConfig =
            serde_yaml::from_str("action: drop\nsource_labels: [__name__]\nregex: '.*'").unwrap();
        let dispatcher = Dispatcher::start(
            vec![
                WriterSpec {
                    name: "filtered".to_string(),
                    writer: filtered.clone(),
                    relabeler: Some(Relabeler::new(&[keep_m0]).unwrap()),
                },
                WriterSpec {
                    name: "silent".to_string(),
                    writer: Arc::new(PanickingWriter::new(u32::MAX)),
                    relabeler: Some(Relabeler::new(&[drop_all]).unwrap()),
                },
                spec("untouched", untouched.clone()),
            ],
            config(16, 10),
        );

        dispatcher.dispatch(samples(3));
        wait_until(|| untouched.samples().len() == 3 && filtered.samples().len() == 1).await;
        wait_until(|| dispatcher.statuses()[1].delivered == 1).await;
        assert_eq!(filtered.samples()[0].name, "m0");
        // An emptied batch never reaches the backend.
        assert_eq!(dispatcher.statuses()[1].health, Health::Healthy);
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_queues() {
        let memory = Arc::new(MemoryWriter::new());
        let dispatcher = Dispatcher::start(vec![spec("memory", memory.clone())], config(64, 1));
        dispatcher.dispatch(samples(20));
        dispatcher.shutdown().await;
        assert_eq!(memory.samples().len(), 20);
        assert_eq!(dispatcher.statuses()[0].health, Health::Healthy);
    }
}
