//! The contract between the runner and whatever turns an entry reference
//! into request-handling code.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use axum::body::Body;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;

use crate::error::{HandlerError, LoadError};

pub type HttpRequest = axum::http::Request<Body>;
pub type HttpResponse = axum::response::Response;

/// Exported request function of a loaded module.
pub trait FetchHandler: Send + Sync {
    fn fetch(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, HandlerError>>;
}

/// Adapts an async closure into a [`FetchHandler`].
pub struct FnHandler<F>(F);

impl<F, Fut> FetchHandler for FnHandler<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HttpResponse, HandlerError>> + Send + 'static,
{
    fn fetch(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, HandlerError>> {
        (self.0)(request).boxed()
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn FetchHandler>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A loaded entry: an optional default export plus named exports.
#[derive(Clone, Default)]
pub struct Module {
    default_export: Option<Arc<dyn FetchHandler>>,
    exports: HashMap<String, Arc<dyn FetchHandler>>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, handler: Arc<dyn FetchHandler>) -> Self {
        self.default_export = Some(handler);
        self
    }

    pub fn with_export(mut self, name: impl Into<String>, handler: Arc<dyn FetchHandler>) -> Self {
        self.exports.insert(name.into(), handler);
        self
    }

    /// Default export first, then the named `fetch` export.
    pub fn fetch_export(&self) -> Option<Arc<dyn FetchHandler>> {
        self.default_export
            .clone()
            .or_else(|| self.exports.get("fetch").cloned())
    }

    pub fn export_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.exports.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("default_export", &self.default_export.is_some())
            .field("exports", &self.export_names())
            .finish()
    }
}

pub trait ModuleLoader: Send + Sync {
    fn load(&self, entry: &str) -> BoxFuture<'_, Result<Module, LoadError>>;
}

type ModuleFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<Module, LoadError>> + Send + Sync>;

/// Entry name to factory. Each `load` re-runs the factory, which is how an
/// embedder swaps code under a running environment.
#[derive(Clone, Default)]
pub struct MapLoader {
    factories: Arc<std::sync::RwLock<HashMap<String, ModuleFactory>>>,
    fallback: Option<Arc<dyn ModuleLoader>>,
}

impl MapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ModuleLoader>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn insert<F, Fut>(&self, entry: impl Into<String>, factory: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Module, LoadError>> + Send + 'static,
    {
        let factory: ModuleFactory = Arc::new(move || factory().boxed());
        self.factories
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(entry.into(), factory);
    }

    pub fn entry<F, Fut>(self, entry: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Module, LoadError>> + Send + 'static,
    {
        self.insert(entry, factory);
        self
    }
}

impl ModuleLoader for MapLoader {
    fn load(&self, entry: &str) -> BoxFuture<'_, Result<Module, LoadError>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(entry)
            .cloned();
        match (factory, &self.fallback) {
            (Some(factory), _) => factory(),
            (None, Some(fallback)) => fallback.load(entry),
            (None, None) => {
                let entry = entry.to_string();
                async move {
                    let message = format!("Cannot find module '{}'", entry);
                    Err(LoadError::new(entry, message))
                }
                .boxed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    fn ok_handler(body: &'static str) -> Arc<dyn FetchHandler> {
        handler_fn(move |_req| async move { Ok(body.into_response()) })
    }

    async fn answer(handler: Arc<dyn FetchHandler>) -> String {
        let request = HttpRequest::new(Body::empty());
        let response = handler.fetch(request).await.expect("fetch");
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn default_export_wins_over_named_fetch() {
        let module = Module::new()
            .with_export("fetch", ok_handler("named"))
            .with_default(ok_handler("default"));
        let chosen = module.fetch_export().expect("handler");
        assert_eq!(answer(chosen).await, "default");

        let named_only = Module::new().with_export("fetch", ok_handler("named"));
        let chosen = named_only.fetch_export().expect("handler");
        assert_eq!(answer(chosen).await, "named");

        let neither = Module::new().with_export("render", ok_handler("other"));
        assert!(neither.fetch_export().is_none());
        assert_eq!(neither.export_names(), vec!["render"]);
    }

    #[tokio::test]
    async fn map_loader_reports_missing_entries() {
        let loader = MapLoader::new().entry("./api.js", || async { Ok(Module::new()) });
        assert!(loader.load("./api.js").await.is_ok());
        let err = loader.load("./nope.js").await.unwrap_err();
        assert_eq!(err.entry, "./nope.js");
        assert!(err.message.contains("Cannot find module"));
    }

    #[tokio::test]
    async fn map_loader_defers_to_fallback() {
        let inner: Arc<dyn ModuleLoader> =
            Arc::new(MapLoader::new().entry("shared", || async { Ok(Module::new()) }));
        let loader = MapLoader::new().with_fallback(inner);
        assert!(loader.load("shared").await.is_ok());
    }
}
