//! Retrying HTTP plumbing shared by the event pipeline.
//!
//! Each attempt gets its own timeout; retries are bounded in count, not in
//! total time, and back off on a doubling schedule capped at 128x the base
//! yield tick. A cancellation token from shutdown aborts in-flight retries.
use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

pub(crate) const DEFAULT_YIELD_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) struct RequestOpts {
    pub method: Method,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Number of retries after the first attempt. 0 means no retry.
    pub retry: u32,
    /// Per-attempt timeout. Overall time is roughly
    /// `(retry + 1) * timeout + backoff`, bounded by the cancellation token.
    pub timeout: Option<Duration>,
    pub yield_interval: Duration,
}

impl RequestOpts {
    pub fn new(method: Method, url: impl Into<String>) -> RequestOpts {
        RequestOpts {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            retry: 0,
            timeout: None,
            yield_interval: DEFAULT_YIELD_INTERVAL,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> RequestOpts {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> RequestOpts {
        self.body = Some(body);
        self
    }

    pub fn with_retry(mut self, retry: u32) -> RequestOpts {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> RequestOpts {
        self.timeout = Some(timeout);
        self
    }
}

pub(crate) struct HttpResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// Thin wrapper around `reqwest::Client`. The client holds a connection pool
/// internally, so it is shared between requests.
#[derive(Clone, Default)]
pub(crate) struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new() -> HttpClient {
        HttpClient::default()
    }

    /// Send the request, retrying on transport errors and non-2xx statuses
    /// until the retry budget runs out or `cancel` fires. The last response
    /// or error is returned either way.
    pub async fn request(
        &self,
        cancel: &CancellationToken,
        opts: &RequestOpts,
    ) -> Result<HttpResponse> {
        let mut last = Err(Error::Closed);
        for attempt in 0..=opts.retry {
            if attempt > 0 && yield_tick(cancel, opts.yield_interval, attempt).await {
                break;
            }
            match self.attempt(cancel, opts).await {
                Ok(resp) if resp.status.is_success() => return Ok(resp),
                outcome => last = outcome,
            }
            if cancel.is_cancelled() {
                break;
            }
        }
        last
    }

    async fn attempt(
        &self,
        cancel: &CancellationToken,
        opts: &RequestOpts,
    ) -> Result<HttpResponse> {
        let mut request = self.client.request(opts.method.clone(), &opts.url);
        for (name, value) in &opts.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &opts.body {
            request = request.body(body.clone());
        }
        if let Some(timeout) = opts.timeout {
            request = request.timeout(timeout);
        }

        let send = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.bytes().await?;
            Ok(HttpResponse {
                status,
                body: body.to_vec(),
            })
        };
        tokio::select! {
            outcome = send => outcome,
            _ = cancel.cancelled() => Err(Error::Closed),
        }
    }
}

/// Wait out the retry backoff, doubling by attempt index modulo 8. Returns
/// `true` when the cancellation token fired instead.
pub(crate) async fn yield_tick(cancel: &CancellationToken, base: Duration, attempt: u32) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(backoff_delay(base, attempt)) => false,
        _ = cancel.cancelled() => true,
    }
}

pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << (attempt % 8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_wraps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 7), Duration::from_millis(12_800));
        // attempt index wraps modulo 8
        assert_eq!(backoff_delay(base, 8), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn retries_exhaust_on_server_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/in/track")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let client = HttpClient::new();
        let mut opts = RequestOpts::new(Method::POST, format!("{}/in/track", server.url()))
            .with_retry(2)
            .with_body(b"[]".to_vec());
        opts.yield_interval = Duration::from_millis(1);

        let outcome = client.request(&CancellationToken::new(), &opts).await;
        mock.assert_async().await;
        assert_eq!(outcome.unwrap().status.as_u16(), 500);
    }

    #[tokio::test]
    async fn cancellation_stops_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/in/track")
            .with_status(500)
            .expect_at_most(1)
            .create_async()
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let client = HttpClient::new();
        let mut opts =
            RequestOpts::new(Method::POST, format!("{}/in/track", server.url())).with_retry(5);
        opts.yield_interval = Duration::from_millis(1);

        let outcome = client.request(&cancel, &opts).await;
        mock.assert_async().await;
        assert!(matches!(outcome, Err(Error::Closed) | Ok(_)));
    }
}
