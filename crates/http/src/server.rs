use std::future::Future;
use std::net::SocketAddr;

use axum::Router;

/// Bind the public port.
pub async fn bind_http(host: &str, port: u16) -> Result<tokio::net::TcpListener, String> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|err| format!("Invalid listen address {}:{}: {}", host, port, err))?;
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| format!("Failed to bind {}: {}", addr, err))
}

/// Serve the public router until `shutdown` resolves.
pub async fn serve_http<F>(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: F,
) -> Result<(), String>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener
        .local_addr()
        .map_err(|err| format!("Failed to read listen address: {}", err))?;
    tracing::info!("http listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|err| format!("HTTP listener exited: {}", err))
}
