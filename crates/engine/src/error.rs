use std::any::Any;
use std::error::Error as StdError;
use std::sync::Arc;

use axum::http::StatusCode;
use thiserror::Error;
use transport::RpcError;

/// Failure to import an environment's entry. Stored on the runner and
/// re-surfaced on every request until the next successful reload.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct LoadError {
    pub entry: String,
    pub message: String,
    #[source]
    pub source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl LoadError {
    pub fn new(entry: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }
}

/// Error returned (or thrown) by environment code while handling a request.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub status: Option<StatusCode>,
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            source: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }
}

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("no such environment: {0}")]
    UnknownEnvironment(String),

    #[error("missing fetch export in environment {0}")]
    MissingFetchExport(String),

    #[error("environment unavailable: {name} (gave up after {attempts} attempts)")]
    Unavailable { name: String, attempts: u32 },

    #[error("failed to load environment {name}: {source}")]
    Load {
        name: String,
        #[source]
        source: LoadError,
    },

    #[error("uncaught error in environment {name}: {source}")]
    Handler {
        name: String,
        #[source]
        source: HandlerError,
    },

    #[error("cross-environment request failed: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
}

impl EnvError {
    pub fn status(&self) -> StatusCode {
        match self {
            EnvError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            EnvError::Handler { source, .. } => {
                source.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            EnvError::Transport { .. } => StatusCode::BAD_GATEWAY,
            EnvError::UnknownEnvironment(_)
            | EnvError::MissingFetchExport(_)
            | EnvError::Load { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        EnvError::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Configuration errors are fatal to the request, never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            EnvError::UnknownEnvironment(_) | EnvError::MissingFetchExport(_)
        )
    }
}

impl From<RpcError> for EnvError {
    fn from(err: RpcError) -> Self {
        EnvError::Transport {
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(
            EnvError::UnknownEnvironment("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            EnvError::Unavailable {
                name: "api".into(),
                attempts: 5
            }
            .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        let handler = EnvError::Handler {
            name: "api".into(),
            source: HandlerError::new("teapot").with_status(StatusCode::IM_A_TEAPOT),
        };
        assert_eq!(handler.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(
            EnvError::from(RpcError::Closed).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn load_error_keeps_source_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "entry.js missing");
        let err = EnvError::Load {
            name: "ssr".into(),
            source: LoadError::new("./entry.js", "import failed").with_source(io),
        };
        let load = err.source().expect("load source");
        assert_eq!(load.to_string(), "import failed");
        let root = load.source().expect("io source");
        assert_eq!(root.to_string(), "entry.js missing");
    }

    #[test]
    fn panic_payloads_are_readable() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(payload.as_ref()), "kaboom");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "panic with non-string payload");
    }
}
