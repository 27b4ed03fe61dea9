//! Turns one getwork reply into a batch of jobs.
//!
//! A single reply can expand into many jobs through ntime rolling: the server
//! permits derivative headers with successive values of the 4-byte time field.
//! The builder also carries the two coupling points that make cancellation
//! consistent: the epoch check that drops batches whose request predates a
//! flush, and the identifier check that flushes when the server moves to a
//! new block template.

use std::time::{Duration, Instant};

use log::debug;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::Value;

use ironmine_core::job::{Job, HEADER_LEN};

use crate::config::GetworkConfig;
use crate::error::{Result, SourceError};
use crate::source::GetworkSource;

/// Offset of the big-endian time field inside the 80-byte header.
const NTIME_OFFSET: usize = 68;

#[derive(Deserialize)]
struct GetworkReply {
    result: Option<GetworkResult>,
}

#[derive(Deserialize)]
struct GetworkResult {
    data: Option<String>,
    target: Option<String>,
    #[serde(default)]
    identifier: Option<Value>,
}

pub(crate) struct RollNtime {
    pub count: u32,
    pub expiry_secs: u64,
}

/// `X-Roll-NTime`: absent or `N` means a single job with the default expiry;
/// any other value permits rolling, 60 jobs unless `expire=<n>` narrows it.
/// The expiry follows the roll count.
pub(crate) fn parse_roll_ntime(headers: &HeaderMap) -> RollNtime {
    let value = headers
        .get("x-roll-ntime")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if value.is_empty() || value.eq_ignore_ascii_case("n") {
        return RollNtime { count: 1, expiry_secs: 60 };
    }
    let mut count = 60u32;
    if let Some((key, raw)) = value.split_once('=') {
        if key.trim().eq_ignore_ascii_case("expire") {
            if let Ok(n) = raw.trim().parse::<u32>() {
                count = n;
            }
        }
    }
    RollNtime { count, expiry_secs: count as u64 }
}

pub(crate) fn is_p2pool(headers: &HeaderMap) -> bool {
    headers
        .get("x-is-p2pool")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Servers send the identifier as an integer or a decimal string; anything
/// else counts as absent.
fn parse_identifier(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

fn decode_fixed<const N: usize>(hex_str: &str, field: &'static str) -> Result<[u8; N]> {
    let bytes = hex::decode(hex_str).map_err(|_| SourceError::BadHex(field))?;
    if bytes.len() != N {
        return Err(SourceError::BadLength { field, expected: N, got: bytes.len() });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

impl GetworkSource {
    /// Expand one response into jobs.
    ///
    /// `epoch` and `now` are captured by the caller before the request went on
    /// the wire. `ignore_empty` treats an empty body as "nothing changed"
    /// (long poll); `discard_if_full` tightens the back-pressure factor.
    pub(crate) fn build_jobs(
        &self,
        cfg: &GetworkConfig,
        headers: &HeaderMap,
        body: &[u8],
        epoch: u64,
        now: Instant,
        source_label: &str,
        ignore_empty: bool,
        discard_if_full: bool,
    ) -> Result<Vec<Job>> {
        if body.is_empty() && ignore_empty {
            debug!("got empty {} response", source_label);
            return Ok(Vec::new());
        }

        let reply: GetworkReply = serde_json::from_slice(body)?;
        let result = reply.result.ok_or(SourceError::MissingField("result"))?;
        let data_hex = result.data.ok_or(SourceError::MissingField("data"))?;
        let target_hex = result.target.ok_or(SourceError::MissingField("target"))?;
        let data = decode_fixed::<HEADER_LEN>(&data_hex, "data")?;
        let target = decode_fixed::<32>(&target_hex, "target")?;
        let identifier = parse_identifier(result.identifier.as_ref());

        // A changed identifier means the server moved to a new template, so
        // everything outstanding is stale.
        let identifier_changed = {
            let mut state = self.coordinator.state.lock();
            if identifier != state.last_identifier {
                state.last_identifier = identifier;
                true
            } else {
                false
            }
        };
        if identifier_changed {
            self.cancel_jobs();
        }

        self.blockchain.check_job(&Job::reference(data, target, identifier));

        let RollNtime { count, expiry_secs } = parse_roll_ntime(headers);
        let expiry_secs = if is_p2pool(headers) { 60 } else { expiry_secs };
        self.stats.set_supports_rollntime(Some(count > 1));
        self.coordinator.set_estimated_jobs(count as usize);

        if epoch != self.coordinator.job_epoch() {
            debug!(
                "discarding {} job(s) from {} response because request was issued before flush",
                count, source_label
            );
            self.stats.add_jobs_received(count as u64);
            return Ok(Vec::new());
        }

        let pressure_factor = if discard_if_full { 1 } else { 5 };
        if self.work_queue.count() > self.work_queue.target() * pressure_factor {
            debug!(
                "discarding {} job(s) from {} response because work buffer is full",
                count, source_label
            );
            self.stats.add_jobs_received(count as u64);
            return Ok(Vec::new());
        }

        let deadline = (now + Duration::from_secs(expiry_secs))
            .checked_sub(cfg.expiry_margin())
            .unwrap_or(now);
        let midstate = Job::calculate_midstate(&data);
        let timebase = u32::from_be_bytes([
            data[NTIME_OFFSET],
            data[NTIME_OFFSET + 1],
            data[NTIME_OFFSET + 2],
            data[NTIME_OFFSET + 3],
        ]);

        let mut jobs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let mut header = data;
            header[NTIME_OFFSET..NTIME_OFFSET + 4]
                .copy_from_slice(&timebase.wrapping_add(i).to_be_bytes());
            let mut job = Job::with_midstate(header, target, midstate, Some(deadline), identifier);
            if let Some(handler) = &self.nonce_handler {
                job.set_handler(handler.clone());
            }
            jobs.push(job);
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ironmine_core::{Blockchain, SourceStats, WorkQueue};
    use reqwest::header::HeaderValue;
    use std::sync::Arc;

    fn test_source(queue_target: usize) -> (Arc<GetworkSource>, Arc<WorkQueue>, Arc<SourceStats>) {
        let queue = Arc::new(WorkQueue::new(queue_target));
        let stats = Arc::new(SourceStats::new());
        let config = GetworkConfig { host: "127.0.0.1".into(), ..Default::default() };
        let source = GetworkSource::new(
            config,
            Arc::clone(&queue),
            Arc::new(Blockchain::new()),
            Arc::clone(&stats),
            None,
        );
        (source, queue, stats)
    }

    fn body(identifier: Option<&str>) -> Vec<u8> {
        let result = match identifier {
            Some(id) => format!(
                r#"{{"result":{{"data":"{}","target":"{}","identifier":{}}}}}"#,
                "00".repeat(80),
                "ff".repeat(32),
                id
            ),
            None => format!(
                r#"{{"result":{{"data":"{}","target":"{}"}}}}"#,
                "00".repeat(80),
                "ff".repeat(32)
            ),
        };
        result.into_bytes()
    }

    fn cfg(source: &GetworkSource) -> GetworkConfig {
        source.config.read().clone()
    }

    #[test]
    fn happy_fetch_builds_one_job() {
        let (source, _, stats) = test_source(8);
        let now = Instant::now();
        let jobs = source
            .build_jobs(&cfg(&source), &HeaderMap::new(), &body(None), 0, now, "getwork", false, false)
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(stats.supports_rollntime(), Some(false));
        // 60s expiry minus the 5s margin
        let deadline = jobs[0].expiry().unwrap();
        assert_eq!(deadline.duration_since(now), Duration::from_secs(55));
    }

    #[test]
    fn expire_header_rolls_monotonic_timebases() {
        let (source, _, stats) = test_source(8);
        let mut headers = HeaderMap::new();
        headers.insert("x-roll-ntime", HeaderValue::from_static("expire=5"));
        let jobs = source
            .build_jobs(&cfg(&source), &headers, &body(None), 0, Instant::now(), "getwork", false, false)
            .unwrap();
        assert_eq!(jobs.len(), 5);
        assert_eq!(stats.supports_rollntime(), Some(true));
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.ntime() as usize, i);
            // everything but the time field matches the first job
            assert_eq!(job.data()[..NTIME_OFFSET], jobs[0].data()[..NTIME_OFFSET]);
            assert_eq!(job.data()[NTIME_OFFSET + 4..], jobs[0].data()[NTIME_OFFSET + 4..]);
            assert_eq!(job.midstate(), jobs[0].midstate());
        }
    }

    #[test]
    fn p2pool_forces_sixty_second_expiry() {
        let (source, _, _) = test_source(128);
        let mut headers = HeaderMap::new();
        headers.insert("x-roll-ntime", HeaderValue::from_static("Y"));
        headers.insert("x-is-p2pool", HeaderValue::from_static("true"));
        let now = Instant::now();
        let jobs = source
            .build_jobs(&cfg(&source), &headers, &body(None), 0, now, "getwork", false, false)
            .unwrap();
        assert_eq!(jobs.len(), 60);
        let deadline = jobs[0].expiry().unwrap();
        assert_eq!(deadline.duration_since(now), Duration::from_secs(55));
    }

    #[test]
    fn stale_epoch_discards_batch_but_counts_it() {
        let (source, queue, stats) = test_source(8);
        let mut headers = HeaderMap::new();
        headers.insert("x-roll-ntime", HeaderValue::from_static("expire=7"));
        // request captured at epoch 3, flush happened since
        for _ in 0..4 {
            source.coordinator.bump_job_epoch();
        }
        let jobs = source
            .build_jobs(&cfg(&source), &headers, &body(None), 3, Instant::now(), "getwork", false, false)
            .unwrap();
        assert!(jobs.is_empty());
        assert_eq!(queue.count(), 0);
        assert_eq!(stats.jobs_received(), 7);
    }

    #[test]
    fn identifier_change_cancels_exactly_once() {
        let (source, queue, _) = test_source(8);
        let config = cfg(&source);
        let now = Instant::now();

        source
            .build_jobs(&config, &HeaderMap::new(), &body(Some("1")), 0, now, "getwork", false, false)
            .unwrap();
        let after_first = queue.cancellations();

        // same identifier again: no cancellation
        source
            .build_jobs(&config, &HeaderMap::new(), &body(Some("1")), 0, now, "getwork", false, false)
            .unwrap();
        assert_eq!(queue.cancellations(), after_first);

        // new identifier: exactly one more
        source
            .build_jobs(&config, &HeaderMap::new(), &body(Some("2")), 0, now, "getwork", false, false)
            .unwrap();
        assert_eq!(queue.cancellations(), after_first + 1);
    }

    #[test]
    fn empty_long_poll_body_is_a_no_op() {
        let (source, queue, stats) = test_source(8);
        let jobs = source
            .build_jobs(&cfg(&source), &HeaderMap::new(), b"", 0, Instant::now(), "long poll", true, true)
            .unwrap();
        assert!(jobs.is_empty());
        assert_eq!(queue.count(), 0);
        assert_eq!(stats.jobs_received(), 0);
        assert_eq!(source.coordinator.job_epoch(), 0);
    }

    #[test]
    fn full_queue_discards_with_tight_factor_for_long_poll() {
        let (source, queue, stats) = test_source(1);
        let config = cfg(&source);
        // fill past target but under the 5x fetch factor
        let seed = source
            .build_jobs(&config, &HeaderMap::new(), &body(None), 0, Instant::now(), "getwork", false, false)
            .unwrap();
        queue.push(seed);
        let more = source
            .build_jobs(&config, &HeaderMap::new(), &body(None), 0, Instant::now(), "getwork", false, false)
            .unwrap();
        queue.push(more);
        assert_eq!(queue.count(), 2);

        // a fetch response still fits (2 <= 1 * 5)
        let fetch = source
            .build_jobs(&config, &HeaderMap::new(), &body(None), 0, Instant::now(), "getwork", false, false)
            .unwrap();
        assert_eq!(fetch.len(), 1);

        // a long poll response does not (2 > 1 * 1)
        let before = stats.jobs_received();
        let lp = source
            .build_jobs(&config, &HeaderMap::new(), &body(None), 0, Instant::now(), "long poll", true, true)
            .unwrap();
        assert!(lp.is_empty());
        assert_eq!(stats.jobs_received(), before + 1);
    }

    #[test]
    fn malformed_responses_are_errors() {
        let (source, _, _) = test_source(8);
        let config = cfg(&source);
        let now = Instant::now();

        let err = source
            .build_jobs(&config, &HeaderMap::new(), b"{}", 0, now, "getwork", false, false)
            .unwrap_err();
        assert!(matches!(err, SourceError::MissingField("result")));

        let bad_hex = format!(
            r#"{{"result":{{"data":"zz{}","target":"{}"}}}}"#,
            "00".repeat(79),
            "ff".repeat(32)
        );
        let err = source
            .build_jobs(&config, &HeaderMap::new(), bad_hex.as_bytes(), 0, now, "getwork", false, false)
            .unwrap_err();
        assert!(matches!(err, SourceError::BadHex("data")));

        let short = format!(
            r#"{{"result":{{"data":"{}","target":"{}"}}}}"#,
            "00".repeat(40),
            "ff".repeat(32)
        );
        let err = source
            .build_jobs(&config, &HeaderMap::new(), short.as_bytes(), 0, now, "getwork", false, false)
            .unwrap_err();
        assert!(matches!(err, SourceError::BadLength { field: "data", .. }));
    }

    #[test]
    fn ill_typed_identifier_counts_as_absent() {
        let (source, queue, _) = test_source(8);
        let config = cfg(&source);
        let now = Instant::now();
        source
            .build_jobs(&config, &HeaderMap::new(), &body(Some("[1,2]")), 0, now, "getwork", false, false)
            .unwrap();
        // absent == initial None, so no cancellation fired
        assert_eq!(queue.cancellations(), 0);
        // a string identifier parses
        source
            .build_jobs(&config, &HeaderMap::new(), &body(Some("\"17\"")), 0, now, "getwork", false, false)
            .unwrap();
        assert_eq!(queue.cancellations(), 1);
    }
}
