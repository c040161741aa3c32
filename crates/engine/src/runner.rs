//! One environment: its entry, the module currently loaded from it, and the
//! request path into that module.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;

use crate::error::{EnvError, HandlerError, LoadError, panic_message};
use crate::error_page::ErrorRenderer;
use crate::module::{HttpRequest, HttpResponse, Module, ModuleLoader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Sum of every delay in the schedule.
    pub fn ceiling(&self) -> Duration {
        let mut backoff = Backoff::new(*self);
        let mut total = Duration::ZERO;
        while let Some(delay) = backoff.next_delay() {
            total = total.saturating_add(delay);
        }
        total
    }
}

/// Readiness wait schedule: `base_delay * 2^attempt` for `max_attempts`
/// attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt += 1;
        Some(self.policy.base_delay.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunnerOptions {
    pub backoff: BackoffPolicy,
    /// Keep serving the last good module while a load error is stored.
    pub serve_stale_on_error: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadOutcome {
    pub name: String,
    pub generation: u64,
    pub state: RunnerState,
    pub error: Option<String>,
    /// A newer reload finished first; this result was discarded.
    pub superseded: bool,
}

impl ReloadOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub name: String,
    pub entry: String,
    pub state: RunnerState,
    pub has_module: bool,
    pub last_error: Option<String>,
    pub generation: u64,
    pub reload_count: u64,
}

struct RunnerInner {
    state: RunnerState,
    module: Option<Arc<Module>>,
    error: Option<LoadError>,
    /// Latest generation handed out by `reload`.
    started: u64,
    /// Generation whose result is currently stored.
    applied: u64,
    reload_count: u64,
}

pub struct EnvironmentRunner {
    name: String,
    entry: String,
    loader: Arc<dyn ModuleLoader>,
    options: RunnerOptions,
    renderer: ErrorRenderer,
    inner: RwLock<RunnerInner>,
    settled: Notify,
}

impl EnvironmentRunner {
    pub fn new(
        name: impl Into<String>,
        entry: impl Into<String>,
        loader: Arc<dyn ModuleLoader>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            name: name.into(),
            entry: entry.into(),
            loader,
            options,
            renderer: ErrorRenderer::default(),
            inner: RwLock::new(RunnerInner {
                state: RunnerState::Unloaded,
                module: None,
                error: None,
                started: 0,
                applied: 0,
                reload_count: 0,
            }),
            settled: Notify::new(),
        }
    }

    pub fn with_renderer(mut self, renderer: ErrorRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn renderer(&self) -> &ErrorRenderer {
        &self.renderer
    }

    pub fn state(&self) -> RunnerState {
        self.read().state
    }

    pub fn has_module(&self) -> bool {
        self.read().module.is_some()
    }

    pub fn last_error(&self) -> Option<LoadError> {
        self.read().error.clone()
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        let inner = self.read();
        RunnerSnapshot {
            name: self.name.clone(),
            entry: self.entry.clone(),
            state: inner.state,
            has_module: inner.module.is_some(),
            last_error: inner.error.as_ref().map(ToString::to_string),
            generation: inner.applied,
            reload_count: inner.reload_count,
        }
    }

    /// Re-import the entry. A failure keeps the previous module around;
    /// a result older than the one already stored is discarded.
    pub async fn reload(&self) -> ReloadOutcome {
        let generation = {
            let mut inner = self.write();
            inner.started += 1;
            inner.state = RunnerState::Loading;
            inner.started
        };
        tracing::debug!("[{}] loading {} (generation {})", self.name, self.entry, generation);

        let loading = AssertUnwindSafe(async { self.loader.load(&self.entry).await });
        let loaded = match loading.catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(LoadError::new(
                self.entry.clone(),
                format!("loader panicked: {}", panic_message(payload.as_ref())),
            )),
        };

        let outcome = {
            let mut inner = self.write();
            if generation <= inner.applied {
                ReloadOutcome {
                    name: self.name.clone(),
                    generation,
                    state: inner.state,
                    error: loaded.err().map(|err| err.to_string()),
                    superseded: true,
                }
            } else {
                inner.applied = generation;
                inner.reload_count += 1;
                let (settled_state, error) = match loaded {
                    Ok(module) => {
                        inner.module = Some(Arc::new(module));
                        inner.error = None;
                        (RunnerState::Ready, None)
                    }
                    Err(err) => {
                        let message = err.to_string();
                        inner.error = Some(err);
                        (RunnerState::Failed, Some(message))
                    }
                };
                if inner.started == generation {
                    inner.state = settled_state;
                }
                ReloadOutcome {
                    name: self.name.clone(),
                    generation,
                    state: inner.state,
                    error,
                    superseded: false,
                }
            }
        };
        self.settled.notify_waiters();

        match (&outcome.error, outcome.superseded) {
            (_, true) => tracing::debug!(
                "[{}] generation {} superseded by a newer reload",
                self.name,
                generation
            ),
            (None, false) => tracing::info!("[{}] ready (generation {})", self.name, generation),
            (Some(err), false) => tracing::warn!("[{}] load failed: {}", self.name, err),
        }
        outcome
    }

    /// Serve a request. Every failure is rendered into a response.
    pub async fn fetch(&self, request: HttpRequest) -> HttpResponse {
        match self.try_fetch(request).await {
            Ok(response) => response,
            Err(err) => self.renderer.render(&err),
        }
    }

    pub async fn try_fetch(&self, request: HttpRequest) -> Result<HttpResponse, EnvError> {
        let module = self.resolve_module().await?;
        let handler = module
            .fetch_export()
            .ok_or_else(|| EnvError::MissingFetchExport(self.name.clone()))?;

        let invocation = AssertUnwindSafe(async move { handler.fetch(request).await });
        match invocation.catch_unwind().await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(EnvError::Handler {
                name: self.name.clone(),
                source: err,
            }),
            Err(payload) => Err(EnvError::Handler {
                name: self.name.clone(),
                source: HandlerError::new(panic_message(payload.as_ref())),
            }),
        }
    }

    async fn resolve_module(&self) -> Result<Arc<Module>, EnvError> {
        let mut backoff = Backoff::new(self.options.backoff);
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.read();
                if let Some(err) = &inner.error {
                    if self.options.serve_stale_on_error {
                        if let Some(module) = &inner.module {
                            return Ok(Arc::clone(module));
                        }
                    }
                    return Err(EnvError::Load {
                        name: self.name.clone(),
                        source: err.clone(),
                    });
                }
                if let Some(module) = &inner.module {
                    return Ok(Arc::clone(module));
                }
            }

            let Some(delay) = backoff.next_delay() else {
                tracing::debug!(
                    "[{}] still unavailable after {} attempts",
                    self.name,
                    backoff.attempt()
                );
                return Err(EnvError::Unavailable {
                    name: self.name.clone(),
                    attempts: backoff.attempt(),
                });
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut notified => {}
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RunnerInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RunnerInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{MapLoader, handler_fn};
    use axum::body::Body;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    async fn body_text(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    fn request(path: &str) -> HttpRequest {
        axum::http::Request::get(path).body(Body::empty()).expect("request")
    }

    fn text_module(body: &'static str) -> Module {
        Module::new().with_export(
            "fetch",
            handler_fn(move |_req| async move { Ok(body.into_response()) }),
        )
    }

    fn runner(loader: MapLoader, entry: &str) -> EnvironmentRunner {
        EnvironmentRunner::new("env", entry, Arc::new(loader), RunnerOptions::default())
            .with_renderer(ErrorRenderer::development())
    }

    #[tokio::test]
    async fn ready_module_serves_requests() {
        let loader = MapLoader::new().entry("./api.js", || async { Ok(text_module("ok")) });
        let runner = runner(loader, "./api.js");
        assert_eq!(runner.state(), RunnerState::Unloaded);

        let outcome = runner.reload().await;
        assert!(outcome.is_ok());
        assert_eq!(runner.state(), RunnerState::Ready);

        let response = runner.fetch(request("/anything")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "ok");
    }

    #[tokio::test]
    async fn import_failure_is_rendered_on_first_request() {
        let loader = MapLoader::new().entry("./ssr.js", || async {
            Err(LoadError::new("./ssr.js", "window is not defined"))
        });
        let runner = runner(loader, "./ssr.js");
        let outcome = runner.reload().await;
        assert_eq!(outcome.state, RunnerState::Failed);

        let response = runner.fetch(request("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("window is not defined"));
    }

    #[tokio::test]
    async fn failed_reload_keeps_last_good_module() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = MapLoader::new().entry("./api.js", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(text_module("v1"))
                } else {
                    Err(LoadError::new("./api.js", "syntax error"))
                }
            }
        });
        let runner = runner(loader, "./api.js");
        runner.reload().await;
        let outcome = runner.reload().await;
        assert_eq!(outcome.state, RunnerState::Failed);
        assert!(runner.has_module());

        // Stored error wins unless stale serving is enabled.
        let response = runner.fetch(request("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn stale_module_serves_when_enabled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = MapLoader::new().entry("./api.js", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(text_module("v1"))
                } else {
                    Err(LoadError::new("./api.js", "syntax error"))
                }
            }
        });
        let options = RunnerOptions {
            serve_stale_on_error: true,
            ..RunnerOptions::default()
        };
        let runner = EnvironmentRunner::new("api", "./api.js", Arc::new(loader), options);
        runner.reload().await;
        runner.reload().await;
        let response = runner.fetch(request("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "v1");
    }

    #[tokio::test]
    async fn missing_export_is_a_500() {
        let loader = MapLoader::new().entry("./lib.js", || async { Ok(Module::new()) });
        let runner = runner(loader, "./lib.js");
        runner.reload().await;
        let err = runner.try_fetch(request("/")).await.unwrap_err();
        assert!(matches!(err, EnvError::MissingFetchExport(_)));
        let response = runner.fetch(request("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("missing fetch export"));
    }

    #[tokio::test]
    async fn handler_errors_and_panics_are_contained() {
        let loader = MapLoader::new()
            .entry("./err.js", || async {
                Ok(Module::new().with_default(handler_fn(|_req| async {
                    Err(HandlerError::new("db offline").with_status(StatusCode::BAD_GATEWAY))
                })))
            })
            .entry("./panic.js", || async {
                Ok(Module::new().with_default(handler_fn(|_req| async {
                    if true {
                        panic!("handler blew up");
                    }
                    Ok(StatusCode::OK.into_response())
                })))
            });
        let loader = Arc::new(loader);

        let failing = EnvironmentRunner::new(
            "err",
            "./err.js",
            loader.clone(),
            RunnerOptions::default(),
        )
        .with_renderer(ErrorRenderer::development());
        failing.reload().await;
        let response = failing.fetch(request("/")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(body_text(response).await.contains("db offline"));

        let panicking =
            EnvironmentRunner::new("panic", "./panic.js", loader, RunnerOptions::default())
                .with_renderer(ErrorRenderer::development());
        panicking.reload().await;
        let response = panicking.fetch(request("/")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body_text(response).await.contains("handler blew up"));
    }

    #[tokio::test(start_paused = true)]
    async fn never_loaded_environment_gives_up_with_503() {
        let loader = MapLoader::new();
        let runner = runner(loader, "./api.js");
        let started = tokio::time::Instant::now();
        let err = runner.try_fetch(request("/")).await.unwrap_err();
        match err {
            EnvError::Unavailable { attempts, .. } => assert_eq!(attempts, 5),
            other => panic!("unexpected error: {other}"),
        }
        let ceiling = BackoffPolicy::default().ceiling();
        assert!(started.elapsed() >= ceiling);
        assert!(started.elapsed() < ceiling + Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_request_wakes_when_first_load_settles() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let loader = MapLoader::new().entry("./slow.js", move || {
            let release_rx = Arc::clone(&release_rx);
            async move {
                let rx = release_rx.lock().await.take();
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok(text_module("late"))
            }
        });
        let runner = Arc::new(runner(loader, "./slow.js"));

        let loading = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.reload().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(runner.state(), RunnerState::Loading);

        let fetching = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.fetch(request("/")).await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        release_tx.send(()).expect("release");

        loading.await.expect("reload task");
        let response = fetching.await.expect("fetch task");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "late");
    }

    #[tokio::test]
    async fn reload_is_idempotent_for_unchanged_code() {
        let loader = MapLoader::new().entry("./api.js", || async { Ok(text_module("same")) });
        let runner = runner(loader, "./api.js");
        runner.reload().await;
        let first = body_text(runner.fetch(request("/x")).await).await;
        runner.reload().await;
        let second = body_text(runner.fetch(request("/x")).await).await;
        assert_eq!(first, second);
        assert_eq!(runner.snapshot().reload_count, 2);
        assert_eq!(runner.state(), RunnerState::Ready);
    }

    #[tokio::test]
    async fn older_generation_never_overwrites_newer() {
        let (slow_tx, slow_rx) = oneshot::channel::<()>();
        let slow_rx = Arc::new(tokio::sync::Mutex::new(Some(slow_rx)));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let loader = MapLoader::new().entry("./api.js", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            let slow_rx = Arc::clone(&slow_rx);
            async move {
                if n == 0 {
                    let rx = slow_rx.lock().await.take();
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                    Ok(text_module("old"))
                } else {
                    Ok(text_module("new"))
                }
            }
        });
        let runner = Arc::new(runner(loader, "./api.js"));

        let first = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.reload().await })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let second = runner.reload().await;
        assert!(!second.superseded);

        slow_tx.send(()).expect("release");
        let first = first.await.expect("first reload");
        assert!(first.superseded);

        let response = runner.fetch(request("/")).await;
        assert_eq!(body_text(response).await, "new");
        assert_eq!(runner.snapshot().generation, 2);
    }

    #[test]
    fn backoff_schedule_doubles_and_counts_attempts() {
        let mut backoff = Backoff::new(BackoffPolicy::default());
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
        assert_eq!(backoff.attempt(), 5);
        assert!(backoff.is_exhausted());
        assert_eq!(BackoffPolicy::default().ceiling(), Duration::from_millis(3100));
    }
}
