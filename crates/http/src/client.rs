//! Outbound requests: to another process's Worker Address, or out to the
//! network. Redirects are never followed and request bodies are streamed.

use axum::body::Body;
use axum::http::header::HOST;
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderValue, Uri};
use transport::WorkerAddress;

use crate::error::FetchError;
use engine::{HttpRequest, HttpResponse};

/// Host header used when a request crosses a domain socket.
pub const SOCKET_HOST: &str = "envmux.local";

#[derive(Clone)]
pub struct OutboundClient {
    http: reqwest::Client,
}

impl OutboundClient {
    pub fn new() -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http })
    }

    /// Send `request` to the listener at `address`. Only the path and query
    /// of the request URI are used.
    pub async fn fetch_address(
        &self,
        address: &WorkerAddress,
        request: HttpRequest,
    ) -> Result<HttpResponse, FetchError> {
        match address {
            WorkerAddress::Socket { socket_path } => {
                fetch_socket(address, socket_path, request).await
            }
            WorkerAddress::Tcp { host, port } => {
                let url = format!("http://{}:{}{}", host, port, path_and_query(request.uri()));
                self.send(url, request).await
            }
        }
    }

    /// Pass a request with an absolute URL straight to the network.
    pub async fn fetch_network(&self, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let uri = request.uri();
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(FetchError::InvalidUrl(uri.to_string()));
        }
        let url = uri.to_string();
        self.send(url, request).await
    }

    async fn send(&self, url: String, request: HttpRequest) -> Result<HttpResponse, FetchError> {
        let (parts, body) = request.into_parts();
        let mut headers = parts.headers;
        headers.remove(HOST);
        let response = self
            .http
            .request(parts.method, url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await?;

        let mut builder = axum::http::Response::builder()
            .status(response.status())
            .version(response.version());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(
                response
                    .headers()
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
        }
        Ok(builder.body(Body::from_stream(response.bytes_stream()))?)
    }
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query()
        .map(PathAndQuery::as_str)
        .unwrap_or("/")
}

#[cfg(unix)]
async fn fetch_socket(
    address: &WorkerAddress,
    socket_path: &std::path::Path,
    request: HttpRequest,
) -> Result<HttpResponse, FetchError> {
    use hyper_util::rt::TokioIo;

    let stream = tokio::net::UnixStream::connect(socket_path)
        .await
        .map_err(|source| FetchError::Connect {
            address: address.clone(),
            source,
        })?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|source| FetchError::Http {
            address: address.clone(),
            source,
        })?;
    let label = socket_path.display().to_string();
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::debug!("socket connection to {} ended: {}", label, err);
        }
    });

    let (mut parts, body) = request.into_parts();
    parts.uri = Uri::try_from(path_and_query(&parts.uri))
        .map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
    parts
        .headers
        .insert(HOST, HeaderValue::from_static(SOCKET_HOST));
    let request = axum::http::Request::from_parts(parts, body);

    let response = sender
        .send_request(request)
        .await
        .map_err(|source| FetchError::Http {
            address: address.clone(),
            source,
        })?;
    Ok(response.map(Body::new))
}

#[cfg(not(unix))]
async fn fetch_socket(
    _address: &WorkerAddress,
    socket_path: &std::path::Path,
    _request: HttpRequest,
) -> Result<HttpResponse, FetchError> {
    Err(FetchError::InvalidUrl(format!(
        "domain sockets are unavailable on this platform: {}",
        socket_path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{NegotiateOptions, negotiate};
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use http_body_util::BodyExt;

    fn test_app() -> Router {
        Router::new()
            .route(
                "/hello",
                get(|uri: Uri| async move { format!("hello {}", uri) }),
            )
            .route("/echo", post(|body: String| async move { body }))
            .route(
                "/moved",
                get(|| async { (StatusCode::FOUND, [("location", "/hello")]) }),
            )
    }

    async fn body_text(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    async fn exercise(force_tcp: bool) {
        let dir = tempfile::tempdir().expect("tempdir");
        let listener = negotiate(&NegotiateOptions::new(dir.path(), "test").force_tcp(force_tcp))
            .await
            .expect("bind");
        let address = listener.address().clone();
        let server = tokio::spawn(listener.serve(test_app()));
        let client = OutboundClient::new().expect("client");

        let request = axum::http::Request::get("http://envmux.local/hello?x=1")
            .body(Body::empty())
            .expect("request");
        let response = client.fetch_address(&address, request).await.expect("fetch");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hello /hello?x=1");

        let request = axum::http::Request::post("/echo")
            .body(Body::from("streamed body"))
            .expect("request");
        let response = client.fetch_address(&address, request).await.expect("fetch");
        assert_eq!(body_text(response).await, "streamed body");

        let request = axum::http::Request::get("/moved")
            .body(Body::empty())
            .expect("request");
        let response = client.fetch_address(&address, request).await.expect("fetch");
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()["location"], "/hello");

        server.abort();
    }

    #[tokio::test]
    async fn fetch_address_over_tcp() {
        exercise(true).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn fetch_address_over_socket() {
        exercise(false).await;
    }

    #[tokio::test]
    async fn network_fetch_requires_absolute_url() {
        let client = OutboundClient::new().expect("client");
        let request = axum::http::Request::get("/relative")
            .body(Body::empty())
            .expect("request");
        let err = client.fetch_network(request).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}
