mod address;
mod channel;
mod error;
mod message;

pub use address::WorkerAddress;
pub use channel::{
    CallOptions, ChannelOptions, DEFAULT_CALL_TIMEOUT, OperationHandler, RpcChannel, StreamFilter,
    new_call_id,
};
pub use error::RpcError;
pub use message::{
    CustomEvent, EnvRegister, Frame, FrameKind, RpcFault, RpcInvoke, RpcResponse, WireMessage,
};
