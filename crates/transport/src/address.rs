use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Where a worker's listener can be reached.
///
/// Decided once when the listener is bound and carried explicitly from then
/// on; callers never re-detect the transport per request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerAddress {
    Socket {
        #[serde(rename = "socketPath")]
        socket_path: PathBuf,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

impl WorkerAddress {
    pub fn socket(path: impl Into<PathBuf>) -> Self {
        Self::Socket {
            socket_path: path.into(),
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn socket_path(&self) -> Option<&PathBuf> {
        match self {
            Self::Socket { socket_path } => Some(socket_path),
            Self::Tcp { .. } => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => Some(*port),
            Self::Socket { .. } => None,
        }
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket { socket_path } => write!(f, "unix:{}", socket_path.display()),
            Self::Tcp { host, port } => write!(f, "http://{}:{}", host, port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tcp_address_has_no_socket_path() {
        let value = serde_json::to_value(WorkerAddress::tcp("127.0.0.1", 4100)).unwrap();
        assert_eq!(value, json!({"host": "127.0.0.1", "port": 4100}));
        assert!(value.get("socketPath").is_none());
    }

    #[test]
    fn socket_address_uses_socket_path_key() {
        let value = serde_json::to_value(WorkerAddress::socket("/tmp/a.sock")).unwrap();
        assert_eq!(value, json!({"socketPath": "/tmp/a.sock"}));
    }

    #[test]
    fn decodes_either_variant() {
        let tcp: WorkerAddress =
            serde_json::from_value(json!({"host": "127.0.0.1", "port": 9})).unwrap();
        assert_eq!(tcp.port(), Some(9));
        assert!(tcp.socket_path().is_none());

        let socket: WorkerAddress =
            serde_json::from_value(json!({"socketPath": "/run/x.sock"})).unwrap();
        assert_eq!(socket.port(), None);
        assert_eq!(socket.to_string(), "unix:/run/x.sock");
    }
}
