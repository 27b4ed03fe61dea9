//! Keep-alive HTTP plumbing shared by the worker pools.
//!
//! Every worker owns one `HttpLink`, which owns at most one keep-alive
//! connection. The contract is strict: on any failure the connection is
//! discarded and the next call dials fresh. A call that started on a reused
//! connection gets one redial before the failure propagates.

use std::time::Duration;

use log::debug;
use reqwest::blocking::Client;
use reqwest::header::{self, HeaderMap, HeaderValue};

use crate::error::{Result, SourceError};

/// Capabilities announced to the server on every request.
pub(crate) const MINING_EXTENSIONS: &str = "longpoll midstate rollntime";

pub(crate) struct HttpLink {
    client: Option<Client>,
    connect_timeout: Duration,
    default_headers: HeaderMap,
}

impl HttpLink {
    pub fn new(connect_timeout: Duration, user_agent: &str, authorization: Option<&str>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("ironmine")),
        );
        headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive"));
        headers.insert("x-mining-extensions", HeaderValue::from_static(MINING_EXTENSIONS));
        if let Some(auth) = authorization {
            if let Ok(mut value) = HeaderValue::from_str(auth) {
                value.set_sensitive(true);
                headers.insert(header::AUTHORIZATION, value);
            }
        }
        Self { client: None, connect_timeout, default_headers: headers }
    }

    /// POST a JSON body; returns response headers and body bytes.
    pub fn post(
        &mut self,
        url: &str,
        body: String,
        timeout: Duration,
        what: &str,
    ) -> Result<(HeaderMap, Vec<u8>)> {
        if self.client.is_some() {
            match self.attempt_post(url, body.clone(), timeout) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!("keep-alive {} connection died: {}", what, err);
                    self.client = None;
                }
            }
        }
        self.attempt_post(url, body, timeout).map_err(|err| {
            self.client = None;
            err
        })
    }

    /// GET for long polling. The connect phase is bounded by the link's
    /// connect timeout; the response read by `response_timeout`.
    pub fn get(
        &mut self,
        url: &str,
        response_timeout: Duration,
        what: &str,
    ) -> Result<(HeaderMap, Vec<u8>)> {
        if self.client.is_some() {
            match self.attempt_get(url, response_timeout) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    debug!("keep-alive {} connection died: {}", what, err);
                    self.client = None;
                }
            }
        }
        self.attempt_get(url, response_timeout).map_err(|err| {
            self.client = None;
            err
        })
    }

    pub fn drop_connection(&mut self) {
        self.client = None;
    }

    fn attempt_post(
        &mut self,
        url: &str,
        body: String,
        timeout: Duration,
    ) -> Result<(HeaderMap, Vec<u8>)> {
        let response = self
            .ensure_client()?
            .post(url)
            .header(header::CONTENT_TYPE, "application/json")
            .timeout(timeout)
            .body(body)
            .send()?;
        Self::read_response(response)
    }

    fn attempt_get(&mut self, url: &str, timeout: Duration) -> Result<(HeaderMap, Vec<u8>)> {
        let response = self.ensure_client()?.get(url).timeout(timeout).send()?;
        Self::read_response(response)
    }

    fn ensure_client(&mut self) -> Result<&Client> {
        if self.client.is_none() {
            let client = Client::builder()
                .connect_timeout(self.connect_timeout)
                .default_headers(self.default_headers.clone())
                .pool_max_idle_per_host(1)
                .timeout(None)
                .build()?;
            self.client = Some(client);
        }
        Ok(self.client.as_ref().expect("client populated above"))
    }

    fn read_response(response: reqwest::blocking::Response) -> Result<(HeaderMap, Vec<u8>)> {
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }
        let headers = response.headers().clone();
        let body = response.bytes()?.to_vec();
        Ok((headers, body))
    }
}
