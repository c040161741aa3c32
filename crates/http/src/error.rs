use engine::EnvError;
use thiserror::Error;
use transport::WorkerAddress;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no such environment: {0}")]
    UnknownEnvironment(String),

    #[error("invalid environment marker: {0}")]
    InvalidMarker(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: WorkerAddress,
        #[source]
        source: std::io::Error,
    },

    #[error("http error talking to {address}: {source}")]
    Http {
        address: WorkerAddress,
        #[source]
        source: hyper::Error,
    },

    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("fetch interceptor is not installed")]
    NotInstalled,

    #[error("fetch interceptor is already installed")]
    AlreadyInstalled,
}

impl From<FetchError> for EnvError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::UnknownEnvironment(name) => EnvError::UnknownEnvironment(name),
            other => EnvError::transport(other.to_string(), other),
        }
    }
}
