//! Demand-driven job fetching.
//!
//! The framework signals demand through `start_fetcher`; each token wakes one
//! worker, which performs a single getwork POST and pushes whatever the
//! builder makes of the response. The long poll handshake rides on fetch
//! responses: `X-Long-Polling` headers spawn or retire listener tasks under
//! the state monitor.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use log::{info, warn};
use reqwest::header::HeaderMap;
use serde_json::json;

use crate::config::GetworkConfig;
use crate::error::{Result, SourceError};
use crate::http::HttpLink;
use crate::longpoll::{self, LongPollEndpoint};
use crate::source::GetworkSource;

impl GetworkSource {
    /// `(running workers, estimated inflight + upcoming jobs)`.
    pub fn running_fetcher_count(&self) -> (usize, usize) {
        let demand = self.coordinator.demand.lock();
        let jobs = (demand.fetcher_jobs_running + demand.fetcher_jobs_pending).max(0) as usize;
        (demand.fetchers_running, jobs)
    }

    /// The framework's demand signal. `None` when no fetcher threads exist,
    /// `Some((0, 0))` when all workers are already claimed, otherwise one
    /// token is issued and exactly one worker will pick it up.
    pub fn start_fetcher(&self) -> Option<(usize, usize)> {
        let capacity = self.fetcher_threads.load(Ordering::Relaxed);
        if capacity == 0 {
            return None;
        }
        let estimated = self.coordinator.estimated_jobs();
        let mut demand = self.coordinator.demand.lock();
        if demand.fetchers_running >= capacity {
            return Some((0, 0));
        }
        demand.fetcher_jobs_pending += estimated as i64;
        demand.fetchers_running += 1;
        demand.fetchers_pending += 1;
        self.coordinator.demand_cond.notify_one();
        Some((1, estimated))
    }

    /// Block until a demand token is available, claim it, and return the job
    /// estimate attached to this transaction. `None` means shutdown.
    fn claim_demand_token(&self, generation: u64) -> Option<i64> {
        let mut demand = self.coordinator.demand.lock();
        loop {
            if demand.shutdown || demand.generation != generation {
                return None;
            }
            if demand.fetchers_pending > 0 {
                break;
            }
            self.coordinator.demand_cond.wait(&mut demand);
        }
        demand.fetchers_pending -= 1;
        let my_jobs = self.coordinator.estimated_jobs() as i64;
        demand.fetcher_jobs_running += my_jobs;
        demand.fetcher_jobs_pending -= my_jobs;
        if demand.fetchers_pending == 0 || demand.fetcher_jobs_pending < 0 {
            demand.fetcher_jobs_pending = 0;
        }
        Some(my_jobs)
    }

    fn finish_demand_token(&self, my_jobs: i64) {
        let mut demand = self.coordinator.demand.lock();
        demand.fetchers_running = demand.fetchers_running.saturating_sub(1);
        demand.fetcher_jobs_running = (demand.fetcher_jobs_running - my_jobs).max(0);
    }

    /// Long poll handshake, under the state monitor.
    ///
    /// A new `X-Long-Polling` URL bumps the run cycle and spawns listeners; a
    /// response without the header retires whatever listeners exist. A URL we
    /// cannot parse changes nothing.
    pub(crate) fn apply_long_poll_headers(
        self: &Arc<Self>,
        cfg: &Arc<GetworkConfig>,
        headers: &HeaderMap,
    ) {
        let mut state = self.coordinator.state.lock();
        if cfg.long_poll_connections == 0 {
            state.signals_new_block = false;
            return;
        }
        let advertised = headers.get("x-long-polling").and_then(|v| v.to_str().ok());
        match advertised {
            Some(url) => {
                if state.long_poll_url.as_deref() == Some(url) {
                    return;
                }
                match parse_long_poll_url(url, &cfg.host, cfg.port) {
                    Ok(endpoint) => {
                        info!("found long polling URL: {}", endpoint.url());
                        state.long_poll_url = Some(url.to_string());
                        state.signals_new_block = true;
                        state.run_cycle += 1;
                        let cycle = state.run_cycle;
                        for i in 0..cfg.long_poll_connections {
                            let source = Arc::clone(self);
                            let worker_cfg = Arc::clone(cfg);
                            let worker_endpoint = endpoint.clone();
                            let spawned = thread::Builder::new()
                                .name(format!("{}_longpoll_{}", cfg.name, i))
                                .spawn(move || {
                                    longpoll::long_poll_loop(source, worker_cfg, worker_endpoint, cycle)
                                });
                            if let Err(err) = spawned {
                                warn!("could not spawn long poll listener: {}", err);
                            }
                        }
                    }
                    Err(err) => warn!("invalid long polling URL: {}", err),
                }
            }
            None => {
                // The server stopped advertising long polling: retire the
                // listeners and stop promising push notifications.
                if state.signals_new_block {
                    state.run_cycle += 1;
                    state.signals_new_block = false;
                }
            }
        }
    }
}

/// Parse an advertised long poll URL. Relative paths inherit the work
/// source's host and port; absolute URLs must be plain HTTP with an explicit
/// port.
pub(crate) fn parse_long_poll_url(
    raw: &str,
    default_host: &str,
    default_port: u16,
) -> Result<LongPollEndpoint> {
    let full;
    let url = if raw.starts_with('/') {
        full = format!("http://{}:{}{}", default_host, default_port, raw);
        full.as_str()
    } else {
        raw
    };

    let rest = url.strip_prefix("http://").ok_or_else(|| SourceError::LongPollUrl {
        url: raw.to_string(),
        reason: "not an http URL",
    })?;

    let (authority, path) = match rest.split_once('/') {
        Some((authority, tail)) => (authority, format!("/{}", tail)),
        None => (rest, "/".to_string()),
    };

    let (host, port) = authority.split_once(':').ok_or_else(|| SourceError::LongPollUrl {
        url: raw.to_string(),
        reason: "host without port",
    })?;
    if host.is_empty() {
        return Err(SourceError::LongPollUrl { url: raw.to_string(), reason: "empty host" });
    }
    let port: u16 = port.parse().map_err(|_| SourceError::LongPollUrl {
        url: raw.to_string(),
        reason: "invalid port",
    })?;

    Ok(LongPollEndpoint { host: host.to_string(), port, path })
}

pub(crate) fn fetcher_loop(source: Arc<GetworkSource>, cfg: Arc<GetworkConfig>, generation: u64) {
    let mut link = HttpLink::new(
        cfg.getwork_timeout(),
        &cfg.user_agent(),
        cfg.authorization().as_deref(),
    );
    let url = cfg.work_url();
    let request_body = json!({"method": "getwork", "params": [], "id": 0}).to_string();

    loop {
        let my_jobs = match source.claim_demand_token(generation) {
            Some(jobs) => jobs,
            None => return,
        };

        let epoch = source.coordinator.job_epoch();
        let now = Instant::now();
        let outcome = link
            .post(&url, request_body.clone(), cfg.getwork_timeout(), "job fetching")
            .and_then(|(headers, body)| {
                source.apply_long_poll_headers(&cfg, &headers);
                source.build_jobs(&cfg, &headers, &body, epoch, now, "getwork", false, false)
            });

        source.finish_demand_token(my_jobs);

        match outcome {
            Ok(jobs) => {
                if !jobs.is_empty() {
                    source.push_jobs(jobs, "getwork response");
                }
            }
            Err(err) => {
                warn!("error while fetching job: {}", err);
                source.handle_error(false);
            }
        }
    }
}
