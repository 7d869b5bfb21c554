//! SDK configuration, normalization and defaults.
use std::sync::Arc;
use std::time::Duration;

use crate::ab::sticky::StickyHandler;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::meta_loader::MetaLoader;

/// URI path events are posted to.
pub const DEFAULT_TRACK_PATH: &str = "/in/track";
/// URI path A/B metadata is fetched from.
pub const DEFAULT_META_PATH: &str = "/ab/all4eval";

pub(crate) const HEADER_SOURCE_TOKEN: &str = "SourceToken";
pub(crate) const SDK_TYPE: &str = "rust-sdk";
pub(crate) const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum number of pre-serialized events buffered in the input channel.
pub(crate) const MAX_EVENT_CHAN_SIZE: usize = 50 * 10;
/// Maximum number of events in a single batch.
pub(crate) const MAX_BATCH_SIZE: usize = 50;
/// Maximum HTTP body size of a single batch request.
pub(crate) const MAX_HTTP_BODY_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_HTTP_CONCURRENCY: usize = 10;
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_HTTP_RETRY: u32 = 2;
const DEFAULT_META_LOAD_INTERVAL: Duration = Duration::from_secs(60);
/// Floor applied to [`AbConfig::meta_load_interval`] at normalization time.
pub(crate) const MIN_META_LOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Callback invoked with the decoded event batch when delivery fails after
/// retries.
pub type OnTrackFail = Arc<dyn Fn(Vec<Event>, &Error) + Send + Sync>;

/// Configuration for the SDK [`crate::Client`].
#[derive(Clone)]
pub struct Config {
    /// URI path for event tracking. Default: [`DEFAULT_TRACK_PATH`].
    pub track_uri_path: String,
    /// Interval for flushing buffered events. Default: 10s.
    pub flush_interval: Duration,
    /// Maximum number of concurrent HTTP senders. Default: 10.
    pub http_concurrency: usize,
    /// Per-attempt timeout for each HTTP request. Default: 3s.
    pub http_timeout: Duration,
    /// Number of retry attempts for failed HTTP requests. Default: 2.
    pub http_retry: u32,
    /// Called when event delivery fails after retries.
    pub on_track_fail: Option<OnTrackFail>,
    /// A/B evaluation configuration. If `None`, A/B APIs are disabled.
    pub ab: Option<AbConfig>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            track_uri_path: DEFAULT_TRACK_PATH.to_owned(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            http_concurrency: DEFAULT_HTTP_CONCURRENCY,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            http_retry: DEFAULT_HTTP_RETRY,
            on_track_fail: None,
            ab: None,
        }
    }
}

impl Config {
    pub fn new() -> Config {
        Config::default()
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Config {
        self.flush_interval = interval;
        self
    }

    pub fn with_http_concurrency(mut self, concurrency: usize) -> Config {
        self.http_concurrency = concurrency;
        self
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Config {
        self.http_timeout = timeout;
        self
    }

    pub fn with_http_retry(mut self, retry: u32) -> Config {
        self.http_retry = retry;
        self
    }

    pub fn with_on_track_fail(mut self, handler: OnTrackFail) -> Config {
        self.on_track_fail = Some(handler);
        self
    }

    pub fn with_ab(mut self, ab: AbConfig) -> Config {
        self.ab = Some(ab);
        self
    }

    pub(crate) fn normalize(&mut self) {
        self.track_uri_path = normalize_uri_path(&self.track_uri_path, DEFAULT_TRACK_PATH);
        if self.flush_interval.is_zero() {
            self.flush_interval = DEFAULT_FLUSH_INTERVAL;
        }
        if self.http_concurrency == 0 {
            self.http_concurrency = DEFAULT_HTTP_CONCURRENCY;
        }
        if self.http_timeout.is_zero() {
            self.http_timeout = DEFAULT_HTTP_TIMEOUT;
        }
        if let Some(ab) = &mut self.ab {
            ab.normalize();
        }
    }
}

/// Configuration for A/B evaluation.
#[derive(Clone, Default)]
pub struct AbConfig {
    /// Secret used by the default signed metadata loader. Required when no
    /// custom [`MetaLoader`] is provided.
    pub project_secret: String,
    /// Endpoint for fetching A/B metadata. Falls back to the main endpoint
    /// when empty.
    pub meta_endpoint: String,
    /// URI path for A/B metadata. Default: [`DEFAULT_META_PATH`].
    pub meta_uri_path: String,
    /// Interval for refreshing A/B metadata. Clamped to a 30s floor.
    pub meta_load_interval: Duration,
    /// Persists sticky assignments. Required for sticky specs.
    pub sticky_handler: Option<Arc<dyn StickyHandler>>,
    /// Custom metadata loader. When set, `meta_endpoint` is ignored.
    pub meta_loader: Option<Arc<dyn MetaLoader>>,
    /// Snapshot JSON from a previous session for faster initial startup.
    pub fast_boot_snapshot: Option<Vec<u8>>,
}

impl AbConfig {
    pub fn new() -> AbConfig {
        AbConfig::default()
    }

    pub fn with_project_secret(mut self, secret: impl Into<String>) -> AbConfig {
        self.project_secret = secret.into();
        self
    }

    pub fn with_meta_endpoint(mut self, endpoint: impl Into<String>) -> AbConfig {
        self.meta_endpoint = endpoint.into();
        self
    }

    pub fn with_meta_load_interval(mut self, interval: Duration) -> AbConfig {
        self.meta_load_interval = interval;
        self
    }

    pub fn with_sticky_handler(mut self, handler: Arc<dyn StickyHandler>) -> AbConfig {
        self.sticky_handler = Some(handler);
        self
    }

    pub fn with_meta_loader(mut self, loader: Arc<dyn MetaLoader>) -> AbConfig {
        self.meta_loader = Some(loader);
        self
    }

    pub fn with_fast_boot_snapshot(mut self, snapshot: Vec<u8>) -> AbConfig {
        self.fast_boot_snapshot = Some(snapshot);
        self
    }

    pub(crate) fn normalize(&mut self) {
        if !self.meta_endpoint.is_empty() {
            if let Ok(normalized) = normalize_endpoint(&self.meta_endpoint) {
                self.meta_endpoint = normalized;
            }
        }
        self.meta_uri_path = normalize_uri_path(&self.meta_uri_path, DEFAULT_META_PATH);
        if self.meta_load_interval.is_zero() {
            self.meta_load_interval = DEFAULT_META_LOAD_INTERVAL;
        }
        self.meta_load_interval = self.meta_load_interval.max(MIN_META_LOAD_INTERVAL);
    }
}

/// Validate the endpoint URL and reduce it to `scheme://host[:port]`.
/// An empty endpoint normalizes to an empty string.
pub(crate) fn normalize_endpoint(endpoint: &str) -> Result<String> {
    if endpoint.is_empty() {
        return Ok(String::new());
    }
    let url = url::Url::parse(endpoint).map_err(Error::InvalidEndpoint)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::SchemeNotHttp);
    }
    let mut normalized = format!("{}://{}", url.scheme(), url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{port}"));
    }
    Ok(normalized)
}

/// Validate a URI path, falling back to `default` when it is empty or
/// malformed.
pub(crate) fn normalize_uri_path(path: &str, default: &str) -> String {
    if path.is_empty()
        || !path.starts_with('/')
        || path.contains("://")
        || path.contains(['?', '#'])
        || path.contains([' ', '\t', '\r', '\n'])
    {
        return default.to_owned();
    }
    path.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_keeps_scheme_and_host_only() {
        assert_eq!(
            normalize_endpoint("https://api.example.com/some/path?q=1").unwrap(),
            "https://api.example.com"
        );
        assert_eq!(
            normalize_endpoint("http://localhost:8080/x").unwrap(),
            "http://localhost:8080"
        );
        assert_eq!(normalize_endpoint("").unwrap(), "");
    }

    #[test]
    fn endpoint_rejects_bad_scheme() {
        assert!(matches!(
            normalize_endpoint("ftp://example.com"),
            Err(Error::SchemeNotHttp)
        ));
        assert!(matches!(
            normalize_endpoint("not a url"),
            Err(Error::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn uri_path_falls_back_on_violations() {
        assert_eq!(normalize_uri_path("/custom", DEFAULT_TRACK_PATH), "/custom");
        assert_eq!(normalize_uri_path("", DEFAULT_TRACK_PATH), DEFAULT_TRACK_PATH);
        assert_eq!(normalize_uri_path("no-slash", DEFAULT_TRACK_PATH), DEFAULT_TRACK_PATH);
        assert_eq!(
            normalize_uri_path("/x?q=1", DEFAULT_TRACK_PATH),
            DEFAULT_TRACK_PATH
        );
        assert_eq!(
            normalize_uri_path("http://x/y", DEFAULT_TRACK_PATH),
            DEFAULT_TRACK_PATH
        );
    }

    #[test]
    fn defaults_fill_in_on_normalize() {
        let mut config = Config {
            flush_interval: Duration::ZERO,
            http_concurrency: 0,
            http_timeout: Duration::ZERO,
            track_uri_path: String::new(),
            ..Config::default()
        };
        config.normalize();
        assert_eq!(config.track_uri_path, DEFAULT_TRACK_PATH);
        assert_eq!(config.flush_interval, Duration::from_secs(10));
        assert_eq!(config.http_concurrency, 10);
        assert_eq!(config.http_timeout, Duration::from_secs(3));
    }

    #[test]
    fn meta_load_interval_is_clamped() {
        let mut ab = AbConfig::new().with_meta_load_interval(Duration::from_secs(5));
        ab.normalize();
        assert_eq!(ab.meta_load_interval, MIN_META_LOAD_INTERVAL);

        let mut ab = AbConfig::new();
        ab.normalize();
        assert_eq!(ab.meta_load_interval, Duration::from_secs(60));
        assert_eq!(ab.meta_uri_path, DEFAULT_META_PATH);
    }
}
