use thiserror::Error;

/// Infrastructure failures surfaced by the stores, the broker, and the
/// HTTP client.
///
/// These are genuine errors, not delivery outcomes: an HTTP attempt that
/// reaches the destination and comes back with a 5xx is *classified*
/// (see [`AttemptOutcome`]), never raised as a `HubError`.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("storage failure: {0}")]
    Storage(String),

    #[error("broker failure: {0}")]
    Broker(String),

    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http client failure: {0}")]
    Http(String),

    /// A consumed message that cannot be turned into a delivery job.
    /// Routed to the dead-letter queue without requeueing.
    #[error("malformed delivery job: {0}")]
    MalformedJob(String),
}

impl From<tokio_postgres::Error> for HubError {
    fn from(err: tokio_postgres::Error) -> Self {
        HubError::Storage(err.to_string())
    }
}

impl From<lapin::Error> for HubError {
    fn from(err: lapin::Error) -> Self {
        HubError::Broker(err.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        HubError::Http(err.to_string())
    }
}

/// Rejections surfaced at the ingest boundary, in precondition order.
///
/// Each variant maps to a distinct response status in the HTTP front-end;
/// the pipeline itself only distinguishes the kinds.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("unknown source `{0}`")]
    SourceNotFound(String),

    #[error("source `{0}` is not active")]
    SourceInactive(String),

    #[error("request signature is missing")]
    MissingSignature,

    #[error("request signature does not match")]
    InvalidSignature,

    #[error(transparent)]
    Infrastructure(#[from] HubError),
}

/// Classified result of a single HTTP delivery attempt.
///
/// Retryable failures are remote or transport conditions that another
/// attempt may clear (429, 5xx, timeouts, connection errors). Everything
/// else the destination said on purpose and repeating the request will
/// not change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 2xx response.
    Success,

    /// 429, 5xx, or a transport failure before any response
    /// (`status == 0` in that case).
    RetryableFailure { status: u16, message: String },

    /// Any other status, including 3xx taken at face value.
    NonRetryableFailure { status: u16, message: String },
}

impl AttemptOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttemptOutcome::RetryableFailure { .. })
    }
}
