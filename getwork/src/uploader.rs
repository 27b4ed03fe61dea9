//! Share upload workers.
//!
//! `nonce_found` enqueues; workers drain the queue, POST the solved header
//! and classify the verdict. Any verdict other than a clean accept means the
//! server has likely moved on, so the job epoch is bumped and outstanding
//! work is flushed. Transport failures retry the same share with a linear
//! back-off, without a retry cap: stopping a persistently failing source is
//! the framework's call.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::Receiver;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};

use ironmine_core::{Job, SubmitOutcome};

use crate::config::GetworkConfig;
use crate::error::Result;
use crate::http::HttpLink;
use crate::source::GetworkSource;

pub(crate) enum UploadMessage {
    Share(PendingShare),
    /// One per uploader at stop.
    Shutdown,
}

pub(crate) struct PendingShare {
    pub job: Job,
    /// Full 80-byte header with the winning nonce already in place.
    pub data: Vec<u8>,
    pub nonce: u32,
    pub difficulty: f64,
}

impl GetworkSource {
    /// Framework hook: queue a found nonce for upload.
    pub fn nonce_found(&self, job: Job, data: Vec<u8>, nonce: u32, difficulty: f64) {
        let tx = self.upload_tx.lock().clone();
        match tx {
            Some(tx) => {
                let _ = tx.send(UploadMessage::Share(PendingShare { job, data, nonce, difficulty }));
            }
            None => debug!("dropping share found while the source is stopped"),
        }
    }
}

/// Classify one submit response.
///
/// `result: true` is the only accept. A non-null `error` payload is the
/// reject reason; otherwise the `X-Reject-Reason` header is consulted, and a
/// reject without either carries no reason at all.
pub(crate) fn classify_submit_response(body: &[u8], headers: &HeaderMap) -> Result<SubmitOutcome> {
    #[derive(Deserialize)]
    struct SubmitReply {
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<Value>,
    }

    let reply: SubmitReply = serde_json::from_slice(body)?;
    if reply.result.as_ref().and_then(Value::as_bool) == Some(true) {
        return Ok(SubmitOutcome::Accepted);
    }
    if let Some(error) = reply.error {
        if !error.is_null() {
            let reason = match error {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Ok(SubmitOutcome::Rejected(Some(reason)));
        }
    }
    let reason = headers
        .get("x-reject-reason")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Ok(SubmitOutcome::Rejected(reason))
}

pub(crate) fn uploader_loop(
    source: Arc<GetworkSource>,
    cfg: Arc<GetworkConfig>,
    rx: Receiver<UploadMessage>,
    generation: u64,
) {
    let mut link = HttpLink::new(
        cfg.sendshare_timeout(),
        &cfg.user_agent(),
        cfg.authorization().as_deref(),
    );
    let url = cfg.work_url();

    loop {
        if source.retired(generation) {
            return;
        }
        let share = match rx.recv() {
            Ok(UploadMessage::Share(share)) => share,
            Ok(UploadMessage::Shutdown) => continue,
            Err(_) => return,
        };

        let mut tries: u64 = 0;
        loop {
            let body =
                json!({"method": "getwork", "params": [hex::encode(&share.data)], "id": 0})
                    .to_string();
            let verdict = link
                .post(&url, body, cfg.sendshare_timeout(), "share upload")
                .and_then(|(headers, body)| classify_submit_response(&body, &headers));

            match verdict {
                Ok(outcome) => {
                    if outcome.is_accepted() {
                        debug!("share {:08x} accepted", share.nonce);
                        source.stats.share_accepted();
                    } else {
                        // The server has moved past this share's template;
                        // everything outstanding is stale.
                        warn!(
                            "share {:08x} rejected ({})",
                            share.nonce,
                            outcome.reason().unwrap_or("no reason")
                        );
                        source.coordinator.bump_job_epoch();
                        source.cancel_jobs();
                        source.stats.share_rejected();
                    }
                    source.handle_success();
                    share.job.nonce_handled(share.nonce, share.difficulty, outcome);
                    break;
                }
                Err(err) => {
                    tries += 1;
                    warn!(
                        "error while sending share {:08x} (difficulty {:.5}): {}",
                        share.nonce, share.difficulty, err
                    );
                    source.stats.submit_retry();
                    source.handle_error(true);
                    thread::sleep(Duration::from_secs(tries.min(30)));
                    if source.retired(generation) {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn true_result_is_accepted() {
        let outcome =
            classify_submit_response(br#"{"result":true,"error":null}"#, &HeaderMap::new()).unwrap();
        assert_eq!(outcome, SubmitOutcome::Accepted);
    }

    #[test]
    fn error_payload_becomes_the_reason() {
        let outcome = classify_submit_response(
            br#"{"result":null,"error":"unknown-work"}"#,
            &HeaderMap::new(),
        )
        .unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected(Some("unknown-work".to_string())));

        let structured = classify_submit_response(
            br#"{"result":false,"error":{"code":-1,"message":"stale"}}"#,
            &HeaderMap::new(),
        )
        .unwrap();
        match structured {
            SubmitOutcome::Rejected(Some(reason)) => assert!(reason.contains("stale")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn header_reason_is_used_when_error_is_null() {
        let mut headers = HeaderMap::new();
        headers.insert("x-reject-reason", HeaderValue::from_static("stale"));
        let outcome =
            classify_submit_response(br#"{"result":false,"error":null}"#, &headers).unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected(Some("stale".to_string())));
    }

    #[test]
    fn reject_without_reason_carries_none() {
        let outcome =
            classify_submit_response(br#"{"result":false,"error":null}"#, &HeaderMap::new())
                .unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected(None));
    }

    #[test]
    fn garbage_body_is_a_transport_level_error() {
        assert!(classify_submit_response(b"not json", &HeaderMap::new()).is_err());
    }
}
