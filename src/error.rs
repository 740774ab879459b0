use thiserror::Error;

/// Failure talking to a remote endpoint.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} responded with {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("invalid snappy payload: {0}")]
    Snappy(#[from] snap::Error),
    #[error("invalid protobuf payload: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Whether another attempt of the same request could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport { .. } => true,
            StoreError::Status { status, .. } => *status >= 500 || *status == 429,
            StoreError::Snappy(_) | StoreError::Decode(_) | StoreError::Other(_) => false,
        }
    }
}

/// Terminal outcome of planning or of one pipeline stage.
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read migration progress for job '{job}': {source}")]
    Progress {
        job: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to fetch block {index} [{mint}, {maxt}): {source}")]
    Fetch {
        index: usize,
        mint: i64,
        maxt: i64,
        #[source]
        source: StoreError,
    },
    #[error("failed to write block {index} [{mint}, {maxt}): {source}")]
    Write {
        index: usize,
        mint: i64,
        maxt: i64,
        #[source]
        source: StoreError,
    },
    #[error("migration cancelled")]
    Cancelled,
    #[error("reader stopped without signalling the end of the block stream")]
    UpstreamAborted,
    #[error("writer stopped accepting blocks")]
    DownstreamClosed,
    #[error("pipeline task panicked: {0}")]
    TaskPanicked(String),
}

impl From<tokio::task::JoinError> for MigrateError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            MigrateError::Cancelled
        } else {
            MigrateError::TaskPanicked(err.to_string())
        }
    }
}
