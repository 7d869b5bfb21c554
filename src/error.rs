use std::sync::Arc;

/// Result type used throughout the SDK.
///
/// This is a standard Rust `Result` whose error variant is the SDK-specific
/// [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The client was already closed.
    #[error("the client was already closed")]
    Closed,

    /// The event input channel is full and no more messages can be accepted.
    #[error("too many requests are already in-flight")]
    TooManyRequests,

    /// The server returned a response the SDK could not interpret.
    #[error("invalid response from server")]
    InvalidResponse,

    /// A single message exceeds the maximum allowed HTTP body size.
    #[error("the message exceeds the maximum allowed http body size")]
    MessageTooBig,

    #[error("event name is empty")]
    EventNameEmpty,

    #[error("event name is too long, >128")]
    EventNameTooLong,

    #[error("property key is too long, >128")]
    PropertyKeyTooLong,

    #[error("login_id and anon_id are both empty")]
    EmptyUserIds,

    #[error("identify requires both login_id and anon_id to be non-empty")]
    IdentifyRequiresBothIds,

    /// An A/B API was called but no A/B configuration was provided.
    #[error("ab core not inited")]
    AbNotInited,

    /// An A/B API was called before any spec snapshot was loaded.
    #[error("ab core not ready")]
    AbNotReady,

    /// A sticky spec was evaluated without a sticky handler configured.
    #[error("ab spec is sticky but no sticky handler is set")]
    AbWithoutSticky,

    /// The sticky handler failed to read or write an assignment.
    #[error("sticky handler error: {0}")]
    StickyHandler(Arc<dyn std::error::Error + Send + Sync>),

    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    #[error("unknown common field: {0}")]
    UnknownCommonField(String),

    #[error("bad bucket_set value: {0}")]
    BucketSetValue(String),

    #[error("endpoint is required")]
    EndpointRequired,

    #[error("project secret is required when no meta loader is set")]
    ProjectSecretRequired,

    #[error("ab config is required")]
    AbConfigRequired,

    /// The endpoint URL failed to parse.
    #[error("invalid endpoint")]
    InvalidEndpoint(#[source] url::ParseError),

    #[error("endpoint scheme must be http or https")]
    SchemeNotHttp,

    /// The server answered with an unexpected HTTP status after retries.
    #[error("http request failed with status {0}")]
    HttpStatus(u16),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// JSON encoding or decoding error.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}
