//! Long poll listeners.
//!
//! Each listener holds a GET open against the advertised URL; the server only
//! answers when a new block appears. The response invalidates all outstanding
//! work and doubles as a fresh getwork reply. Listeners are parameterized by
//! the run cycle they were born under and retire themselves once a newer
//! cycle exists.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

use ironmine_core::Job;

use crate::config::GetworkConfig;
use crate::error::Result;
use crate::http::HttpLink;
use crate::source::GetworkSource;

/// Failure pacing: short naps for sporadic failures, long ones once the
/// failure density passes `MAX_QUICK_RETRIES` inside the reset window.
const RETRY_WINDOW: Duration = Duration::from_secs(60);
const MAX_QUICK_RETRIES: u32 = 5;
const QUICK_RETRY_PAUSE: Duration = Duration::from_secs(1);
const SLOW_RETRY_PAUSE: Duration = Duration::from_secs(30);

/// Responses land with a one second back-dated capture time so the freshly
/// flushed epoch window cannot swallow fetch responses captured microseconds
/// earlier under a skewed clock.
const CAPTURE_BACKDATE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub(crate) struct LongPollEndpoint {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl LongPollEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.path)
    }
}

enum Turn {
    /// A newer run cycle exists; the listener must exit without touching state.
    Retired,
    Jobs(Vec<Job>),
}

pub(crate) fn long_poll_loop(
    source: Arc<GetworkSource>,
    cfg: Arc<GetworkConfig>,
    endpoint: LongPollEndpoint,
    birth_cycle: u64,
) {
    let mut link = HttpLink::new(
        cfg.long_poll_connect_timeout(),
        &cfg.user_agent(),
        cfg.authorization().as_deref(),
    );
    let url = endpoint.url();
    let mut tries: u32 = 0;
    let mut window_start = Instant::now();

    loop {
        if source.coordinator.run_cycle() > birth_cycle {
            return;
        }
        match poll_once(&source, &cfg, &mut link, &url, birth_cycle) {
            Ok(Turn::Retired) => return,
            Ok(Turn::Jobs(jobs)) => {
                if !jobs.is_empty() {
                    source.push_jobs(jobs, "long poll response");
                }
            }
            Err(err) => {
                link.drop_connection();
                warn!("long poll failed: {}", err);
                tries += 1;
                if window_start.elapsed() >= RETRY_WINDOW {
                    tries = 0;
                }
                let pause = if tries > MAX_QUICK_RETRIES {
                    SLOW_RETRY_PAUSE
                } else {
                    QUICK_RETRY_PAUSE
                };
                thread::sleep(pause);
                window_start = Instant::now();
            }
        }
    }
}

fn poll_once(
    source: &Arc<GetworkSource>,
    cfg: &Arc<GetworkConfig>,
    link: &mut HttpLink,
    url: &str,
    birth_cycle: u64,
) -> Result<Turn> {
    // Claimed before the request goes out: a response that raced a newer
    // listener's response must not supplant it.
    let epoch = source.coordinator.next_lp_epoch();

    let (headers, body) = link.get(url, cfg.long_poll_response_timeout(), "long poll")?;

    if source.coordinator.run_cycle() > birth_cycle {
        return Ok(Turn::Retired);
    }

    {
        let mut state = source.coordinator.state.lock();
        if epoch > state.lp_epoch {
            state.lp_epoch = epoch;
            state.job_epoch += 1;
            drop(state);
            source.cancel_jobs();
        }
    }

    let now = Instant::now();
    let now = now.checked_sub(CAPTURE_BACKDATE).unwrap_or(now);
    let job_epoch = source.coordinator.job_epoch();
    let jobs = source.build_jobs(cfg, &headers, &body, job_epoch, now, "long poll", true, true)?;
    Ok(Turn::Jobs(jobs))
}
