//! The getwork work source.
//!
//! Adapts a remote getwork server to the framework: fetchers pull candidate
//! headers on demand, uploaders ship found nonces back, long poll listeners
//! flush outstanding work when the chain moves. Lifecycle and the hooks the
//! framework calls live here; the worker loops live in their own modules.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use ironmine_core::{Blockchain, Job, NonceHandler, SourceStats, StatsSnapshot, WorkQueue};

use crate::config::GetworkConfig;
use crate::coordinator::Coordinator;
use crate::error::{Result, SourceError};
use crate::fetcher;
use crate::uploader::{self, UploadMessage};

/// How long `stop()` waits for each worker before abandoning it. A worker
/// stuck in blocking I/O exits at its next suspension point.
const JOIN_WAIT: Duration = Duration::from_secs(1);

pub struct GetworkSource {
    pub(crate) config: RwLock<GetworkConfig>,
    pub(crate) coordinator: Coordinator,
    pub(crate) work_queue: Arc<WorkQueue>,
    pub(crate) blockchain: Arc<Blockchain>,
    pub(crate) stats: Arc<SourceStats>,
    pub(crate) nonce_handler: Option<Arc<dyn NonceHandler>>,
    pub(crate) upload_tx: Mutex<Option<Sender<UploadMessage>>>,
    /// Number of live fetcher threads; zero while stopped. `start_fetcher`
    /// reports failure when there is nobody to signal.
    pub(crate) fetcher_threads: AtomicUsize,
    consecutive_errors: AtomicU32,
    runtime: Mutex<Runtime>,
}

#[derive(Default)]
struct Runtime {
    started: bool,
    active: Option<Arc<GetworkConfig>>,
    fetchers: Vec<JoinHandle<()>>,
    uploaders: Vec<JoinHandle<()>>,
}

impl GetworkSource {
    pub fn new(
        config: GetworkConfig,
        work_queue: Arc<WorkQueue>,
        blockchain: Arc<Blockchain>,
        stats: Arc<SourceStats>,
        nonce_handler: Option<Arc<dyn NonceHandler>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            coordinator: Coordinator::new(),
            work_queue,
            blockchain,
            stats,
            nonce_handler,
            upload_tx: Mutex::new(None),
            fetcher_threads: AtomicUsize::new(0),
            consecutive_errors: AtomicU32::new(0),
            runtime: Mutex::new(Runtime::default()),
        })
    }

    /// Spawn the fetcher and uploader pools. Long poll listeners are spawned
    /// later, by the first fetch response that advertises a long poll URL.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let cfg = Arc::new(self.config.read().clone());
        cfg.validate().map_err(|err| SourceError::Config(err.to_string()))?;

        let mut runtime = self.runtime.lock();
        if runtime.started {
            return Ok(());
        }

        self.coordinator.reset_for_start();
        self.stats.set_supports_rollntime(None);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        let generation = self.coordinator.generation();

        let (tx, rx) = channel::unbounded();
        *self.upload_tx.lock() = Some(tx);

        let mut fetchers = Vec::with_capacity(cfg.getwork_connections);
        for i in 0..cfg.getwork_connections {
            let source = Arc::clone(self);
            let worker_cfg = Arc::clone(&cfg);
            let handle = thread::Builder::new()
                .name(format!("{}_fetcher_{}", cfg.name, i))
                .spawn(move || fetcher::fetcher_loop(source, worker_cfg, generation))?;
            fetchers.push(handle);
        }

        let mut uploaders = Vec::with_capacity(cfg.upload_connections);
        for i in 0..cfg.upload_connections {
            let source = Arc::clone(self);
            let worker_cfg = Arc::clone(&cfg);
            let worker_rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}_uploader_{}", cfg.name, i))
                .spawn(move || uploader::uploader_loop(source, worker_cfg, worker_rx, generation))?;
            uploaders.push(handle);
        }

        info!(
            "{}: started {} fetcher(s), {} uploader(s) for {}",
            cfg.name,
            fetchers.len(),
            uploaders.len(),
            cfg.work_url()
        );

        self.fetcher_threads.store(fetchers.len(), Ordering::Relaxed);
        runtime.fetchers = fetchers;
        runtime.uploaders = uploaders;
        runtime.active = Some(cfg);
        runtime.started = true;
        Ok(())
    }

    /// Poison long poll listeners, wake every worker and join with a bounded
    /// wait. Workers stuck in blocking I/O are abandoned; the generation
    /// counter keeps them from rejoining a later pool.
    pub fn stop(&self) {
        let mut runtime = self.runtime.lock();
        if !runtime.started {
            return;
        }
        debug!("stopping getwork work source");

        self.coordinator.bump_run_cycle();
        self.coordinator.begin_shutdown();

        if let Some(tx) = self.upload_tx.lock().take() {
            for _ in 0..runtime.uploaders.len() {
                let _ = tx.send(UploadMessage::Shutdown);
            }
        }

        for handle in runtime.fetchers.drain(..) {
            join_with_timeout(handle, JOIN_WAIT);
        }
        for handle in runtime.uploaders.drain(..) {
            join_with_timeout(handle, JOIN_WAIT);
        }

        self.fetcher_threads.store(0, Ordering::Relaxed);
        runtime.active = None;
        runtime.started = false;
        info!("getwork work source stopped");
    }

    pub fn is_started(&self) -> bool {
        self.runtime.lock().started
    }

    /// Stop and start again without blocking the caller.
    pub fn async_restart(self: &Arc<Self>) {
        let source = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("getwork_restart".to_string())
            .spawn(move || {
                source.stop();
                if let Err(err) = source.start() {
                    warn!("restart failed: {}", err);
                }
            });
        if let Err(err) = spawned {
            warn!("could not spawn restart thread: {}", err);
        }
    }

    /// Install a new configuration. Changes to host, port or connection
    /// counts restart the pools; everything else applies on the next start.
    pub fn apply_config(self: &Arc<Self>, new: GetworkConfig) {
        let restart = {
            let runtime = self.runtime.lock();
            match &runtime.active {
                Some(active) if runtime.started => new.needs_restart(active),
                _ => false,
            }
        };
        *self.config.write() = new;
        if restart {
            self.async_restart();
        }
    }

    pub fn signals_new_block(&self) -> bool {
        self.coordinator.state.lock().signals_new_block
    }

    pub fn long_poll_url(&self) -> Option<String> {
        self.coordinator.state.lock().long_poll_url.clone()
    }

    pub fn statistics(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn push_jobs(&self, jobs: Vec<Job>, label: &str) {
        debug!("pushing {} job(s) from {}", jobs.len(), label);
        self.stats.add_jobs_received(jobs.len() as u64);
        self.work_queue.push(jobs);
    }

    pub(crate) fn cancel_jobs(&self) {
        self.work_queue.cancel_all();
    }

    pub(crate) fn handle_success(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    pub(crate) fn handle_error(&self, on_submit: bool) {
        self.stats.transport_error();
        let run = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("source error #{} (submit: {})", run, on_submit);
    }

    pub(crate) fn retired(&self, generation: u64) -> bool {
        self.coordinator.retired(generation)
    }
}

fn join_with_timeout(handle: JoinHandle<()>, limit: Duration) {
    let deadline = Instant::now() + limit;
    while !handle.is_finished() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    if handle.is_finished() {
        let _ = handle.join();
    } else {
        debug!(
            "worker {} still blocked at stop, abandoning",
            handle.thread().name().unwrap_or("<unnamed>")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GetworkConfig;

    fn stopped_source(host: &str) -> Arc<GetworkSource> {
        GetworkSource::new(
            GetworkConfig { host: host.into(), ..Default::default() },
            Arc::new(WorkQueue::new(4)),
            Arc::new(Blockchain::new()),
            Arc::new(SourceStats::new()),
            None,
        )
    }

    #[test]
    fn start_rejects_missing_host() {
        let source = stopped_source("");
        assert!(source.start().is_err());
        assert!(!source.is_started());
        assert_eq!(source.start_fetcher(), None);
    }

    #[test]
    fn apply_config_while_stopped_only_stores() {
        let source = stopped_source("pool.example");
        let mut next = source.config.read().clone();
        next.host = "other.example".into();
        next.getwork_connections = 4;
        source.apply_config(next);
        assert_eq!(source.config.read().host, "other.example");
        assert!(!source.is_started());
    }

    #[test]
    fn stop_before_start_is_a_no_op() {
        let source = stopped_source("pool.example");
        source.stop();
        assert!(!source.is_started());
    }
}
