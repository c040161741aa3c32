//! Picks the address a process listens on for cross-environment requests:
//! a domain socket when the platform demonstrably supports one, otherwise
//! an ephemeral loopback port.

use std::path::{Path, PathBuf};

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use nanoid::nanoid;
use transport::WorkerAddress;

/// Longest socket path we attempt; `sun_path` is 104 bytes on macOS.
pub const MAX_SOCKET_PATH: usize = 100;

const NAME_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

#[derive(Debug, Clone)]
pub struct NegotiateOptions {
    pub socket_dir: PathBuf,
    pub label: String,
    pub force_tcp: bool,
}

impl NegotiateOptions {
    pub fn new(socket_dir: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            label: label.into(),
            force_tcp: false,
        }
    }

    pub fn force_tcp(mut self, force_tcp: bool) -> Self {
        self.force_tcp = force_tcp;
        self
    }
}

/// A bound listener together with the address it was bound to.
pub struct NegotiatedListener {
    address: WorkerAddress,
    inner: Bound,
}

enum Bound {
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        _cleanup: SocketCleanup,
    },
    Tcp(tokio::net::TcpListener),
}

/// Removes the socket file when the listener goes away.
struct SocketCleanup(PathBuf);

impl Drop for SocketCleanup {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!("failed to remove socket {}: {}", self.0.display(), err);
            }
        }
    }
}

pub fn socket_name(label: &str) -> String {
    let label: String = label
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect();
    format!(
        "envmux-{}-{}-{}.sock",
        std::process::id(),
        label,
        nanoid!(10, &NAME_ALPHABET)
    )
}

/// True only when a throwaway socket could be bound and removed in `dir`.
pub fn socket_supported(dir: &Path) -> bool {
    #[cfg(unix)]
    {
        let probe = dir.join(socket_name("probe"));
        if probe.as_os_str().len() > MAX_SOCKET_PATH {
            return false;
        }
        match std::os::unix::net::UnixListener::bind(&probe) {
            Ok(listener) => {
                drop(listener);
                let _ = std::fs::remove_file(&probe);
                true
            }
            Err(err) => {
                tracing::debug!("socket probe in {} failed: {}", dir.display(), err);
                false
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        false
    }
}

/// Bind a listener for this process. Never fails over to an error when
/// TCP loopback is still available.
pub async fn negotiate(options: &NegotiateOptions) -> Result<NegotiatedListener, String> {
    if !options.force_tcp {
        if let Some(listener) = try_bind_unix(options) {
            return Ok(listener);
        }
    }

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|err| format!("Failed to bind loopback listener: {}", err))?;
    let port = listener
        .local_addr()
        .map_err(|err| format!("Failed to read loopback address: {}", err))?
        .port();
    let address = WorkerAddress::tcp("127.0.0.1", port);
    tracing::debug!("[{}] listening on {}", options.label, address);
    Ok(NegotiatedListener {
        address,
        inner: Bound::Tcp(listener),
    })
}

#[cfg(unix)]
fn try_bind_unix(options: &NegotiateOptions) -> Option<NegotiatedListener> {
    let path = options.socket_dir.join(socket_name(&options.label));
    if path.as_os_str().len() > MAX_SOCKET_PATH {
        tracing::debug!(
            "socket path too long ({} bytes), using tcp",
            path.as_os_str().len()
        );
        return None;
    }
    if !socket_supported(&options.socket_dir) {
        return None;
    }
    match tokio::net::UnixListener::bind(&path) {
        Ok(listener) => {
            let address = WorkerAddress::socket(path.clone());
            tracing::debug!("[{}] listening on {}", options.label, address);
            Some(NegotiatedListener {
                address,
                inner: Bound::Unix {
                    listener,
                    _cleanup: SocketCleanup(path),
                },
            })
        }
        Err(err) => {
            tracing::warn!(
                "failed to bind unix socket {}: {} (falling back to tcp)",
                path.display(),
                err
            );
            None
        }
    }
}

#[cfg(not(unix))]
fn try_bind_unix(_options: &NegotiateOptions) -> Option<NegotiatedListener> {
    None
}

impl NegotiatedListener {
    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    /// Serve `app` until the listener fails. The socket file, if any, is
    /// removed when this future completes or is dropped.
    pub async fn serve(self, app: Router) -> Result<(), String> {
        match self.inner {
            #[cfg(unix)]
            Bound::Unix { listener, _cleanup } => {
                loop {
                    let (stream, _) = listener.accept().await.map_err(|err| err.to_string())?;
                    let service = TowerToHyperService::new(app.clone());
                    tokio::spawn(async move {
                        let builder = Builder::new(TokioExecutor::new());
                        let io = TokioIo::new(stream);
                        if let Err(err) = builder.serve_connection(io, service).await {
                            tracing::debug!("unix connection failed: {}", err);
                        }
                    });
                }
            }
            Bound::Tcp(listener) => axum::serve(listener, app)
                .await
                .map_err(|err| format!("Listener exited: {}", err)),
        }
    }
}
