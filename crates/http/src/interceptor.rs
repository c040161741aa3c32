//! Process-wide `fetch` that recognises requests aimed at another
//! environment and routes them there instead of to the network.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use engine::{EnvironmentRegistry, EnvironmentRunner, HttpRequest, HttpResponse};
use transport::WorkerAddress;

use crate::client::OutboundClient;
use crate::error::FetchError;

/// Header carrying the target environment across process boundaries.
pub const ENV_HEADER: &str = "x-envmux-env";

/// Origin that relative inputs are resolved against.
pub const LOCAL_ORIGIN: &str = "http://envmux.local";

static INTERCEPTOR: OnceLock<Arc<Interceptor>> = OnceLock::new();

pub enum FetchInput {
    Url(String),
    Request(HttpRequest),
}

impl From<&str> for FetchInput {
    fn from(url: &str) -> Self {
        FetchInput::Url(url.to_string())
    }
}

impl From<String> for FetchInput {
    fn from(url: String) -> Self {
        FetchInput::Url(url)
    }
}

impl From<HttpRequest> for FetchInput {
    fn from(request: HttpRequest) -> Self {
        FetchInput::Request(request)
    }
}

#[derive(Default)]
pub struct FetchInit {
    pub environment: Option<String>,
    pub method: Option<Method>,
    pub headers: HeaderMap,
    pub body: Option<Body>,
}

impl FetchInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn environment(mut self, name: impl Into<String>) -> Self {
        self.environment = Some(name.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Where the target environment marker was found, in precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerSource {
    InitOption(String),
    InitHeader(String),
    RequestHeader(String),
}

impl MarkerSource {
    pub fn detect(input: &FetchInput, init: &FetchInit) -> Option<Self> {
        if let Some(name) = &init.environment {
            return Some(MarkerSource::InitOption(name.clone()));
        }
        if let Some(name) = header_marker(&init.headers) {
            return Some(MarkerSource::InitHeader(name));
        }
        match input {
            FetchInput::Request(request) => {
                header_marker(request.headers()).map(MarkerSource::RequestHeader)
            }
            FetchInput::Url(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MarkerSource::InitOption(name)
            | MarkerSource::InitHeader(name)
            | MarkerSource::RequestHeader(name) => name,
        }
    }
}

fn header_marker(headers: &HeaderMap) -> Option<String> {
    headers
        .get(ENV_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

/// Where a named environment lives, relative to this process.
#[derive(Clone)]
pub enum Target {
    Local(Arc<EnvironmentRunner>),
    Remote(WorkerAddress),
}

pub struct Interceptor {
    local: Arc<EnvironmentRegistry>,
    remote: RwLock<HashMap<String, WorkerAddress>>,
    client: OutboundClient,
}

impl Interceptor {
    pub fn new(local: Arc<EnvironmentRegistry>, client: OutboundClient) -> Self {
        Self {
            local,
            remote: RwLock::new(HashMap::new()),
            client,
        }
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.local
    }

    pub fn client(&self) -> &OutboundClient {
        &self.client
    }

    /// Record where another process serves `name`.
    pub fn set_remote(&self, name: impl Into<String>, address: WorkerAddress) {
        let name = name.into();
        tracing::debug!("environment {} is served at {}", name, address);
        self.remote
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, address);
    }

    pub fn remotes(&self) -> HashMap<String, WorkerAddress> {
        self.remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Environments hosted here win over remote ones of the same name.
    pub fn resolve(&self, name: &str) -> Option<Target> {
        if let Some(runner) = self.local.get(name) {
            return Some(Target::Local(runner));
        }
        self.remote
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .map(Target::Remote)
    }

    pub async fn fetch(
        &self,
        input: impl Into<FetchInput>,
        init: FetchInit,
    ) -> Result<HttpResponse, FetchError> {
        let input = input.into();
        let marker = MarkerSource::detect(&input, &init);

        let Some(marker) = marker else {
            let request = build_request(input, init, false)?;
            return self.client.fetch_network(request).await;
        };

        let name = marker.name().to_string();
        let target = self
            .resolve(&name)
            .ok_or_else(|| FetchError::UnknownEnvironment(name.clone()))?;
        let marker_value =
            HeaderValue::from_str(&name).map_err(|_| FetchError::InvalidMarker(name.clone()))?;

        let mut request = build_request(input, init, true)?;
        request.headers_mut().insert(ENV_HEADER, marker_value);

        match target {
            Target::Local(runner) => Ok(runner.fetch(request).await),
            Target::Remote(address) => self.client.fetch_address(&address, request).await,
        }
    }
}

/// Merge input and init into one request. With `absolute`, path-only URLs
/// are resolved against [`LOCAL_ORIGIN`].
fn build_request(
    input: FetchInput,
    init: FetchInit,
    absolute: bool,
) -> Result<HttpRequest, FetchError> {
    let FetchInit {
        method,
        headers,
        body,
        ..
    } = init;

    let mut request = match input {
        FetchInput::Url(url) => {
            let uri: Uri = url.parse().map_err(|_| FetchError::InvalidUrl(url.clone()))?;
            let mut request = axum::http::Request::new(Body::empty());
            *request.uri_mut() = uri;
            request
        }
        FetchInput::Request(request) => request,
    };

    if let Some(method) = method {
        *request.method_mut() = method;
    }
    for (name, value) in headers.iter() {
        request.headers_mut().insert(name.clone(), value.clone());
    }
    if let Some(body) = body {
        *request.body_mut() = body;
    }
    if absolute && request.uri().scheme().is_none() {
        let resolved = absolutize(request.uri())?;
        *request.uri_mut() = resolved;
    }
    Ok(request)
}

fn absolutize(uri: &Uri) -> Result<Uri, FetchError> {
    let path = uri
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };
    let joined = format!("{}{}", LOCAL_ORIGIN, path);
    joined.parse().map_err(|_| FetchError::InvalidUrl(joined))
}

/// Install the process-wide interceptor. Only the first call succeeds.
pub fn install(interceptor: Arc<Interceptor>) -> Result<(), FetchError> {
    INTERCEPTOR
        .set(interceptor)
        .map_err(|_| FetchError::AlreadyInstalled)
}

pub fn installed() -> Option<Arc<Interceptor>> {
    INTERCEPTOR.get().cloned()
}

/// `fetch` through the installed interceptor.
pub async fn fetch(
    input: impl Into<FetchInput>,
    init: FetchInit,
) -> Result<HttpResponse, FetchError> {
    let interceptor = installed().ok_or(FetchError::NotInstalled)?;
    interceptor.fetch(input, init).await
}
