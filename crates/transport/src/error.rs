use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("rpc call '{operation}' ({id}) timed out after {after_ms}ms")]
    Timeout {
        operation: String,
        id: String,
        after_ms: u64,
    },

    #[error("channel closed")]
    Closed,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unknown rpc operation: {0}")]
    UnknownOperation(String),

    #[error("duplicate rpc id: {0}")]
    DuplicateId(String),

    #[error("encode error: {0}")]
    Encode(String),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Timeout { .. })
    }
}
