//! Wire format shared by the host and its workers.
//!
//! One frame per line of JSON:
//!
//! ```text
//! {"type":"control","payload":{"type":"custom","event":"rpc-invoke","data":{"name":"status","id":"x1","data":null}}}
//! {"type":"control","streamTag":"api","payload":{"type":"full-reload"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::address::WorkerAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Data,
    Control,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    #[serde(rename = "streamTag", default, skip_serializing_if = "Option::is_none")]
    pub stream_tag: Option<String>,
    pub payload: WireMessage,
}

impl Frame {
    pub fn data(payload: WireMessage, stream_tag: Option<String>) -> Self {
        Self {
            kind: FrameKind::Data,
            stream_tag,
            payload,
        }
    }

    pub fn control(payload: WireMessage) -> Self {
        Self::tagged_control(payload, None)
    }

    pub fn tagged_control(payload: WireMessage, stream_tag: Option<String>) -> Self {
        Self {
            kind: FrameKind::Control,
            stream_tag,
            payload,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        self.stream_tag.as_deref()
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    Custom(CustomEvent),
    FullReload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum CustomEvent {
    EnvRegister(EnvRegister),
    RpcInvoke(RpcInvoke),
    RpcResponse(RpcResponse),
    ListenAddress(WorkerAddress),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvRegister {
    pub name: String,
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcInvoke {
    pub name: String,
    pub id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcFault>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFault {
    pub message: String,
}

impl RpcResponse {
    pub fn ok(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: None,
            error: Some(RpcFault {
                message: message.into(),
            }),
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(fault) => Err(fault.message),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

impl WireMessage {
    pub fn env_register(name: impl Into<String>, entry: impl Into<String>) -> Self {
        Self::Custom(CustomEvent::EnvRegister(EnvRegister {
            name: name.into(),
            entry: entry.into(),
        }))
    }

    pub fn listen_address(address: WorkerAddress) -> Self {
        Self::Custom(CustomEvent::ListenAddress(address))
    }
}
