//! Media worker pool and load-based room placement.
//!
//! The pool is fixed at startup. Each worker carries a CPU-load estimate
//! written only by the sampler task and read lock-free by placement, so
//! readers may see a value one interval stale.
//!
//! A worker that dies cannot be recovered without losing every room bound
//! to it. The death watcher logs, waits a grace delay for log flush and
//! then publishes the death; the binary exits when [`WorkerPool::fatal`]
//! resolves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::engine::{EngineWorker, MediaEngine, WorkerSettings};
use crate::errors::SfuError;
use crate::observability::metrics as prom;

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub webrtc_port_base: u16,
    pub announced_address: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub death_grace: Duration,
}

impl PoolSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            size: config.num_workers,
            webrtc_port_base: config.webrtc_port_base,
            announced_address: config.announced_address.clone(),
            rtc_min_port: config.rtc_min_port,
            rtc_max_port: config.rtc_max_port,
            death_grace: config.worker_death_grace,
        }
    }
}

/// Published once a worker has died and the grace delay has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub index: usize,
    pub reason: String,
}

impl From<WorkerDeath> for SfuError {
    fn from(death: WorkerDeath) -> Self {
        SfuError::WorkerDied {
            index: death.index,
            reason: death.reason,
        }
    }
}

/// One engine worker plus its sampled load.
pub struct WorkerHandle {
    index: usize,
    worker: Arc<dyn EngineWorker>,
    listen_port: u16,
    /// `f64` bits of the last sampled load.
    load_bits: AtomicU64,
    /// Cumulative CPU nanoseconds at the previous sample.
    last_cpu_nanos: AtomicU64,
}

impl WorkerHandle {
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn worker(&self) -> &Arc<dyn EngineWorker> {
        &self.worker
    }

    #[must_use]
    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    /// Fraction of one CPU consumed during the last sample interval.
    #[must_use]
    pub fn load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    fn store_load(&self, load: f64) {
        self.load_bits.store(load.to_bits(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.index)
            .field("worker_id", &self.worker.id())
            .field("listen_port", &self.listen_port)
            .field("load", &self.load())
            .finish()
    }
}

fn duration_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Index of the lowest load. Ties go to the lowest index.
#[must_use]
pub fn least_loaded_index(loads: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, &load) in loads.iter().enumerate() {
        if load.is_nan() {
            continue;
        }
        match best {
            Some((_, best_load)) if load >= best_load => {}
            _ => best = Some((index, load)),
        }
    }
    best.map(|(index, _)| index)
}

/// Fixed-size pool of engine workers.
pub struct WorkerPool {
    workers: Vec<Arc<WorkerHandle>>,
    death_tx: Arc<watch::Sender<Option<WorkerDeath>>>,
    death_rx: watch::Receiver<Option<WorkerDeath>>,
}

impl WorkerPool {
    /// Start `settings.size` workers and their death watchers.
    ///
    /// Watchers stop when `cancel` fires, so a clean shutdown that closes
    /// workers is not reported as a death.
    #[instrument(skip_all, name = "sfu.pool.create", fields(size = settings.size))]
    pub async fn create(
        engine: Arc<dyn MediaEngine>,
        settings: PoolSettings,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, SfuError> {
        if settings.size == 0 {
            return Err(SfuError::Config(
                "worker pool size must be greater than zero".to_string(),
            ));
        }

        let (death_tx, death_rx) = watch::channel(None);
        let death_tx = Arc::new(death_tx);
        let mut workers = Vec::with_capacity(settings.size);

        for index in 0..settings.size {
            let port = u16::try_from(index)
                .ok()
                .and_then(|offset| settings.webrtc_port_base.checked_add(offset))
                .ok_or_else(|| {
                    SfuError::Config(format!("no WebRTC port available for worker {index}"))
                })?;

            let worker = engine
                .create_worker(WorkerSettings {
                    index,
                    webrtc_port: port,
                    announced_address: settings.announced_address.clone(),
                    rtc_min_port: settings.rtc_min_port,
                    rtc_max_port: settings.rtc_max_port,
                })
                .await?;

            // Baseline so the first sample covers one interval only
            let baseline = match worker.resource_usage().await {
                Ok(usage) => duration_nanos(usage.cpu_time),
                Err(e) => {
                    warn!(
                        target: "sfu.pool",
                        worker = index,
                        error = %e,
                        "Failed to read baseline CPU usage"
                    );
                    0
                }
            };

            info!(
                target: "sfu.pool",
                worker = index,
                worker_id = %worker.id(),
                listen_port = port,
                "Media worker started"
            );

            let handle = Arc::new(WorkerHandle {
                index,
                worker,
                listen_port: port,
                load_bits: AtomicU64::new(0f64.to_bits()),
                last_cpu_nanos: AtomicU64::new(baseline),
            });

            Self::spawn_death_watcher(
                Arc::clone(&handle),
                Arc::clone(&death_tx),
                settings.death_grace,
                cancel.clone(),
            );

            workers.push(handle);
        }

        Ok(Arc::new(Self {
            workers,
            death_tx,
            death_rx,
        }))
    }

    fn spawn_death_watcher(
        handle: Arc<WorkerHandle>,
        death_tx: Arc<watch::Sender<Option<WorkerDeath>>>,
        grace: Duration,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            let reason = tokio::select! {
                () = cancel.cancelled() => return,
                reason = handle.worker.died() => reason,
            };

            error!(
                target: "sfu.pool",
                worker = handle.index,
                worker_id = %handle.worker.id(),
                reason = %reason,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "Media worker died; process will exit"
            );

            tokio::time::sleep(grace).await;

            let death = WorkerDeath {
                index: handle.index,
                reason,
            };
            death_tx.send_if_modified(|slot| {
                if slot.is_none() {
                    *slot = Some(death);
                    true
                } else {
                    false
                }
            });
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    #[must_use]
    pub fn workers(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    /// Snapshot of every worker's last sampled load, by index.
    #[must_use]
    pub fn loads(&self) -> Vec<f64> {
        self.workers.iter().map(|w| w.load()).collect()
    }

    /// Worker for a new room.
    pub fn select_least_loaded(&self) -> Result<Arc<WorkerHandle>, SfuError> {
        let loads = self.loads();
        let selected = least_loaded_index(&loads)
            .and_then(|index| self.workers.get(index))
            .cloned()
            .ok_or(SfuError::NoWorkers)?;

        debug!(
            target: "sfu.pool",
            worker = selected.index,
            load = selected.load(),
            "Selected least loaded worker"
        );
        Ok(selected)
    }

    /// Take one load sample of every worker.
    ///
    /// `load = delta_cpu_time / interval`. A failed usage read keeps the
    /// previous load.
    pub async fn sample_loads(&self, interval: Duration) {
        let interval_secs = interval.as_secs_f64();
        if interval_secs <= 0.0 {
            return;
        }

        for handle in &self.workers {
            match handle.worker.resource_usage().await {
                Ok(usage) => {
                    let now = duration_nanos(usage.cpu_time);
                    let previous = handle.last_cpu_nanos.swap(now, Ordering::Relaxed);
                    let delta = Duration::from_nanos(now.saturating_sub(previous));
                    let load = delta.as_secs_f64() / interval_secs;
                    handle.store_load(load);
                    prom::set_worker_load(handle.index, load);
                }
                Err(e) => {
                    warn!(
                        target: "sfu.pool",
                        worker = handle.index,
                        error = %e,
                        "Failed to sample worker CPU usage, keeping previous load"
                    );
                }
            }
        }
    }

    /// Spawn the periodic sampler. It is the only writer of worker loads.
    pub fn spawn_load_sampler(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(target: "sfu.pool", "Load sampler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        pool.sample_loads(interval).await;
                    }
                }
            }
        })
    }

    /// Resolves once a worker death has been published.
    ///
    /// Returns `None` only if the pool is dropped first.
    pub async fn fatal(&self) -> Option<WorkerDeath> {
        let mut rx = self.death_rx.clone();
        let death = match rx.wait_for(Option::is_some).await {
            Ok(death) => death.clone(),
            Err(_) => None,
        };
        death
    }

    /// Non-blocking check for a published worker death.
    #[must_use]
    pub fn death(&self) -> Option<WorkerDeath> {
        self.death_tx.borrow().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_least_loaded_picks_minimum() {
        assert_eq!(least_loaded_index(&[0.7, 0.3]), Some(1));
        assert_eq!(least_loaded_index(&[0.2, 0.9, 0.1, 0.5]), Some(2));
    }

    #[test]
    fn test_least_loaded_first_index_wins_ties() {
        assert_eq!(least_loaded_index(&[0.4, 0.4]), Some(0));
        assert_eq!(least_loaded_index(&[0.9, 0.1, 0.1]), Some(1));
        assert_eq!(least_loaded_index(&[0.0, 0.0, 0.0]), Some(0));
    }

    #[test]
    fn test_least_loaded_empty_and_nan() {
        assert_eq!(least_loaded_index(&[]), None);
        assert_eq!(least_loaded_index(&[f64::NAN, 0.5]), Some(1));
        assert_eq!(least_loaded_index(&[f64::NAN]), None);
    }

    #[test]
    fn test_worker_death_converts_to_fatal_error() {
        let err: SfuError = WorkerDeath {
            index: 1,
            reason: "killed".to_string(),
        }
        .into();
        assert_eq!(err.class(), crate::errors::ErrorClass::Fatal);
    }
}
