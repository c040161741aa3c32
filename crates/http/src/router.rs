use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use engine::{EnvError, EnvironmentRegistry, ErrorRenderer, HttpRequest, HttpResponse, RouteConfig};

use crate::interceptor::{ENV_HEADER, FetchInit, FetchInput, Interceptor};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Static(String),
    Param(String),
}

/// `/static/segments`, `:param` segments and an optional trailing `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
    wildcard: bool,
}

/// Ordering key: more static segments, then more params, then exact over
/// wildcard, then explicit method over `*`.
type Specificity = (usize, usize, bool, bool);

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if !raw.starts_with('/') {
            return Err(format!("Route pattern must start with '/': {}", raw));
        }
        let parts: Vec<&str> = raw.split('/').filter(|part| !part.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());
        let mut wildcard = false;
        for (index, part) in parts.iter().enumerate() {
            if *part == "*" {
                if index + 1 != parts.len() {
                    return Err(format!("Wildcard must be the last segment: {}", raw));
                }
                wildcard = true;
            } else if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(format!("Empty parameter name in route: {}", raw));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Static((*part).to_string()));
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
            wildcard,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Captured params and the path left over for the wildcard, if any.
    ///
    /// Empty segments are skipped while matching, but the leftover is cut
    /// from the raw path so trailing and doubled slashes survive.
    fn match_path(&self, path: &str) -> Option<(HashMap<String, String>, Option<String>)> {
        let parts = segments_with_end(path);
        if parts.len() < self.segments.len() {
            return None;
        }
        if !self.wildcard && parts.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, (part, _)) in self.segments.iter().zip(&parts) {
            match segment {
                Segment::Static(expected) if expected.as_str() == *part => {}
                Segment::Static(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), (*part).to_string());
                }
            }
        }
        let rest = if self.wildcard {
            let consumed = match self.segments.len() {
                0 => 0,
                n => parts[n - 1].1,
            };
            Some(path[consumed..].to_string())
        } else {
            None
        };
        Some((params, rest))
    }

    fn specificity(&self) -> (usize, usize, bool) {
        let statics = self
            .segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Static(_)))
            .count();
        (statics, self.segments.len() - statics, !self.wildcard)
    }
}

/// Non-empty segments of `path` with the byte offset just past each.
fn segments_with_end(path: &str) -> Vec<(&str, usize)> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (index, ch) in path.char_indices().chain(std::iter::once((path.len(), '/'))) {
        if ch == '/' {
            if index > start {
                parts.push((&path[start..index], index));
            }
            start = index + 1;
        }
    }
    parts
}

#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// `None` matches every method.
    pub method: Option<Method>,
    pub pattern: RoutePattern,
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub environment: String,
    pub pattern: String,
    pub params: HashMap<String, String>,
    /// Path with the consumed prefix stripped.
    pub forwarded_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, String> {
        let mut table = Self::new();
        for route in routes {
            table.add(&route.method, &route.path, &route.environment)?;
        }
        Ok(table)
    }

    pub fn add(&mut self, method: &str, pattern: &str, environment: &str) -> Result<(), String> {
        let method = match method.trim() {
            "*" | "" => None,
            other => Some(
                Method::from_bytes(other.to_ascii_uppercase().as_bytes())
                    .map_err(|_| format!("Invalid route method: {}", other))?,
            ),
        };
        self.entries.push(RouteEntry {
            method,
            pattern: RoutePattern::parse(pattern)?,
            environment: environment.to_string(),
        });
        Ok(())
    }

    pub fn route(mut self, method: &str, pattern: &str, environment: &str) -> Result<Self, String> {
        self.add(method, pattern, environment)?;
        Ok(self)
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Most specific match; ties keep table order.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let mut best: Option<(Specificity, &RouteEntry, HashMap<String, String>, Option<String>)> =
            None;
        for entry in &self.entries {
            if let Some(expected) = &entry.method {
                if expected != method {
                    continue;
                }
            }
            let Some((params, rest)) = entry.pattern.match_path(path) else {
                continue;
            };
            let (statics, dynamic, exact) = entry.pattern.specificity();
            let key = (statics, dynamic, exact, entry.method.is_some());
            if best.as_ref().is_none_or(|(current, ..)| key > *current) {
                best = Some((key, entry, params, rest));
            }
        }
        best.map(|(_, entry, params, rest)| RouteMatch {
            environment: entry.environment.clone(),
            pattern: entry.pattern.as_str().to_string(),
            params,
            forwarded_path: forwarded_path(rest),
        })
    }
}

fn forwarded_path(rest: Option<String>) -> String {
    match rest {
        Some(rest) if rest.starts_with('/') => rest,
        Some(rest) => format!("/{}", rest),
        None => "/".to_string(),
    }
}

/// Front door: resolves the owning environment and forwards through the
/// interceptor.
pub struct Dispatcher {
    table: RouteTable,
    interceptor: Arc<Interceptor>,
    renderer: ErrorRenderer,
}

impl Dispatcher {
    pub fn new(table: RouteTable, interceptor: Arc<Interceptor>, renderer: ErrorRenderer) -> Self {
        Self {
            table,
            interceptor,
            renderer,
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub async fn dispatch(&self, mut request: HttpRequest) -> HttpResponse {
        let Some(matched) = self.table.resolve(request.method(), request.uri().path()) else {
            tracing::debug!("no route for {} {}", request.method(), request.uri().path());
            return (StatusCode::NOT_FOUND, "Not Found").into_response();
        };

        let forwarded = match request.uri().query() {
            Some(query) => format!("{}?{}", matched.forwarded_path, query),
            None => matched.forwarded_path.clone(),
        };
        match forwarded.parse::<Uri>() {
            Ok(uri) => *request.uri_mut() = uri,
            Err(err) => {
                tracing::warn!("could not rewrite {}: {}", forwarded, err);
                return self.renderer.render(&EnvError::Transport {
                    message: format!("invalid forwarded path: {}", forwarded),
                    source: None,
                });
            }
        }
        tracing::debug!(
            "{} {} -> {} ({})",
            request.method(),
            forwarded,
            matched.environment,
            matched.pattern
        );

        let init = FetchInit::new().environment(matched.environment);
        match self.interceptor.fetch(FetchInput::Request(request), init).await {
            Ok(response) => response,
            Err(err) => self.renderer.render(&EnvError::from(err)),
        }
    }
}

/// Public router: every request goes through the dispatcher.
pub fn app_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .fallback(handle_request)
        .with_state(dispatcher)
}

async fn handle_request(State(dispatcher): State<Arc<Dispatcher>>, request: Request) -> Response {
    dispatcher.dispatch(request).await
}

/// Router for a process listener: serves the environment named by the
/// marker header from the local registry.
pub fn environment_router(registry: Arc<EnvironmentRegistry>) -> Router {
    Router::new()
        .fallback(handle_environment_request)
        .with_state(registry)
}

async fn handle_environment_request(
    State(registry): State<Arc<EnvironmentRegistry>>,
    request: Request,
) -> Response {
    let name = request
        .headers()
        .get(ENV_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let name = match name {
        Some(name) => name,
        None => {
            // A single hosted environment needs no marker.
            let names = registry.names();
            match names.as_slice() {
                [only] => only.clone(),
                _ => {
                    return (StatusCode::BAD_REQUEST, "Missing x-envmux-env header")
                        .into_response();
                }
            }
        }
    };
    match registry.require(&name) {
        Ok(runner) => runner.fetch(request).await,
        Err(err) => registry.renderer().render(&err),
    }
}
