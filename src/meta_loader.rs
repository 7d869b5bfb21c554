//! Metadata loading strategies.
//!
//! The loader is injected into [`crate::ab::AbCore`] so tests (and callers
//! with their own distribution channel) can replace it wholesale. The
//! default strategy is a signed HTTP GET against the metadata endpoint.
use std::collections::HashMap;
use std::time::Duration;

use crate::ab::models::{MetaEnvelope, MetaResponse};
use crate::config::{HEADER_SOURCE_TOKEN, SDK_TYPE, SDK_VERSION};
use crate::error::{Error, Result};
use crate::http::{backoff_delay, DEFAULT_YIELD_INTERVAL};
use crate::signature::sign_request;

/// Fetches the A/B metadata envelope. One call is one attempt from the
/// core's point of view; implementations may retry internally.
pub trait MetaLoader: Send + Sync {
    fn load_meta(&self) -> Result<MetaEnvelope>;
}

/// Default loader: signed GET to `{endpoint}{uri_path}`, authenticated with
/// the ACS3-HMAC-SHA256 scheme.
pub struct SignedHttpMetaLoader {
    endpoint: String,
    uri_path: String,
    source_token: String,
    project_secret: String,
    retry: u32,
    client: reqwest::blocking::Client,
}

impl SignedHttpMetaLoader {
    pub fn new(
        endpoint: String,
        uri_path: String,
        source_token: String,
        project_secret: String,
    ) -> SignedHttpMetaLoader {
        SignedHttpMetaLoader {
            endpoint,
            uri_path,
            source_token,
            project_secret,
            retry: 2,
            client: reqwest::blocking::Client::new(),
        }
    }

    fn attempt(&self, url: &str, headers: &HashMap<String, String>) -> Result<MetaEnvelope> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request.send()?;
        let status = response.status();
        let body = response.bytes()?;
        if status.as_u16() != 200 {
            return Err(Error::HttpStatus(status.as_u16()));
        }
        let decoded: MetaResponse = serde_json::from_slice(&body)?;
        Ok(decoded.data)
    }
}

impl std::fmt::Debug for SignedHttpMetaLoader {
    // the project secret stays out of log output
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedHttpMetaLoader")
            .field("endpoint", &self.endpoint)
            .field("uri_path", &self.uri_path)
            .field("source_token", &self.source_token)
            .field("retry", &self.retry)
            .finish()
    }
}

impl MetaLoader for SignedHttpMetaLoader {
    fn load_meta(&self) -> Result<MetaEnvelope> {
        let mut headers = HashMap::from([
            ("Content-Type".to_owned(), "application/json".to_owned()),
            (HEADER_SOURCE_TOKEN.to_owned(), self.source_token.clone()),
            ("X-SDK".to_owned(), SDK_TYPE.to_owned()),
            ("X-SDK-Version".to_owned(), SDK_VERSION.to_owned()),
        ]);
        // empty body for GET
        let signed = sign_request(
            "GET",
            &self.uri_path,
            "",
            &headers,
            b"",
            &self.source_token,
            &self.project_secret,
        );
        headers.extend(signed);

        let url = format!("{}{}", self.endpoint.trim_end_matches('/'), self.uri_path);

        let mut last = Err(Error::InvalidResponse);
        for attempt in 0..=self.retry {
            if attempt > 0 {
                std::thread::sleep(yield_gap(attempt));
            }
            match self.attempt(&url, &headers) {
                Ok(envelope) => return Ok(envelope),
                Err(err) => last = Err(err),
            }
        }
        last
    }
}

fn yield_gap(attempt: u32) -> Duration {
    backoff_delay(DEFAULT_YIELD_INTERVAL, attempt)
}
