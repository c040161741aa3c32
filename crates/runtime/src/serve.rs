use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use cmd::Context;
use engine::{
    BuiltinLoader, EnvironmentRegistry, ErrorRenderer, ModuleLoader, ReloadController,
    RuntimeConfig, WorkerOptions,
};
use http::{
    Dispatcher, Interceptor, NegotiateOptions, OutboundClient, RouteTable, app_router, bind_http,
    environment_router, negotiate, serve_http,
};
use pool::{PoolConfig, WorkerPool, WorkerSpec};
use serde_json::{Value, json};
use stdio as stdio_log;
use tokio::task::JoinHandle;
use transport::WorkerAddress;

use crate::watch::{WatchGuard, start_watch};

pub fn serve(context: &Context) {
    stdio_log::init_tracing();
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            stdio_log::error("serve", &format!("failed to start tokio runtime: {}", err));
            std::process::exit(1);
        }
    };

    if let Err(err) = rt.block_on(serve_async(context)) {
        stdio_log::error("serve", &err);
        std::process::exit(1);
    }
}

async fn serve_async(context: &Context) -> Result<(), String> {
    let config_path = context.path_arg().map(|path| {
        if path.is_dir() {
            path.join("envmux.toml")
        } else {
            path
        }
    });
    let mut config = RuntimeConfig::load(config_path.as_deref())?;
    if let Some(port) = context.param("--port") {
        config.server.port = port
            .parse()
            .map_err(|err| format!("Invalid --port {}: {}", port, err))?;
    }
    if context.flag("--dev") {
        config.server.dev = true;
        config.watch.enabled = true;
    }
    if context.flag("--watch") {
        config.watch.enabled = true;
    }

    let loader: Arc<dyn ModuleLoader> = Arc::new(BuiltinLoader::new(&config.base_dir));
    serve_config(config, loader, shutdown_signal()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    stdio_log::log("serve", "shutting down");
}

/// Start a host from `config` and serve the public port until `shutdown`.
pub async fn serve_config<F>(
    config: RuntimeConfig,
    loader: Arc<dyn ModuleLoader>,
    shutdown: F,
) -> Result<(), String>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = bind_http(&config.server.host, config.server.port).await?;
    let host = Host::start(config, loader).await?;
    if let Ok(addr) = listener.local_addr() {
        stdio_log::log("serve", &format!("http://{}", addr));
    }
    let served = serve_http(listener, host.router(), shutdown).await;
    host.shutdown().await;
    served
}

/// Everything the host process runs besides the public listener.
///
/// Environments with `isolate = false` are loaded into the host's own
/// registry and exposed to workers through a negotiated listener; every
/// other environment gets its own worker process.
pub struct Host {
    registry: Arc<EnvironmentRegistry>,
    interceptor: Arc<Interceptor>,
    dispatcher: Arc<Dispatcher>,
    pool: Option<Arc<WorkerPool>>,
    local_server: Option<JoinHandle<Result<(), String>>>,
    local_address: Option<WorkerAddress>,
    watcher: Option<WatchGuard>,
}

impl Host {
    pub async fn start(config: RuntimeConfig, loader: Arc<dyn ModuleLoader>) -> Result<Self, String> {
        config.validate()?;
        let renderer = ErrorRenderer::new(config.server.dev);
        if config.server.dev {
            stdio_log::log("dev", "enabled");
        }

        let registry = Arc::new(EnvironmentRegistry::new(
            loader,
            config.runner_options(),
            renderer.clone(),
        ));
        let client = OutboundClient::new().map_err(|err| err.to_string())?;
        let interceptor = Arc::new(Interceptor::new(Arc::clone(&registry), client));
        if let Err(err) = http::install(Arc::clone(&interceptor)) {
            tracing::debug!("interceptor not installed: {}", err);
        }

        let (local, isolated): (Vec<_>, Vec<_>) = config
            .environments
            .iter()
            .cloned()
            .partition(|env| !env.isolate);

        let mut extra = Vec::new();
        let mut local_server = None;
        let mut local_address = None;
        if !local.is_empty() {
            for env in &local {
                registry.register(&env.name, &env.entry);
                stdio_log::log("env", &format!("{} -> {} (host)", env.name, env.entry));
            }
            let listener = negotiate(
                &NegotiateOptions::new(config.socket_dir(), "host")
                    .force_tcp(config.server.force_tcp),
            )
            .await?;
            let address = listener.address().clone();
            for env in &local {
                extra.push((env.name.clone(), address.clone()));
            }
            local_server = Some(tokio::spawn(
                listener.serve(environment_router(Arc::clone(&registry))),
            ));
            local_address = Some(address);
        }

        let pool = if isolated.is_empty() {
            None
        } else {
            let program = std::env::current_exe()
                .map_err(|err| format!("Failed to locate envmux binary: {}", err))?;
            let pool_config = PoolConfig {
                program,
                args: vec!["worker".to_string()],
                current_dir: config.base_dir.clone(),
                env: WorkerOptions::for_worker(&config, "worker").to_env(),
                rpc_timeout: config.rpc_timeout(),
                listen_timeout: Duration::from_millis(config.rpc.listen_timeout_ms),
            };
            let specs: Vec<WorkerSpec> = isolated.into_iter().map(WorkerSpec::single).collect();
            let pool = match WorkerPool::start(pool_config, specs, &extra).await {
                Ok(pool) => pool,
                Err(err) => {
                    if let Some(server) = &local_server {
                        server.abort();
                    }
                    return Err(err);
                }
            };
            for (name, address) in pool.addresses() {
                stdio_log::log("env", &format!("{} -> {}", name, address));
                interceptor.set_remote(name, address);
            }
            Some(Arc::new(pool))
        };

        let table = RouteTable::from_config(&config.routes)?;
        let dispatcher = Arc::new(Dispatcher::new(
            table,
            Arc::clone(&interceptor),
            renderer,
        ));

        let watcher = if config.watch.enabled {
            let paths: Vec<PathBuf> = config.watch_paths();
            let guard = start_watch(
                &paths,
                Duration::from_millis(config.watch.debounce_ms),
                ReloadController::new(Arc::clone(&registry)),
                pool.clone(),
            )?;
            Some(guard)
        } else {
            None
        };

        Ok(Self {
            registry,
            interceptor,
            dispatcher,
            pool,
            local_server,
            local_address,
            watcher,
        })
    }

    pub fn registry(&self) -> &Arc<EnvironmentRegistry> {
        &self.registry
    }

    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    /// Address of the listener serving host-local environments, if any.
    pub fn local_address(&self) -> Option<&WorkerAddress> {
        self.local_address.as_ref()
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    pub fn router(&self) -> Router {
        app_router(Arc::clone(&self.dispatcher))
    }

    /// Snapshots of host-local environments plus every worker's report.
    pub async fn status(&self) -> Value {
        let workers = match &self.pool {
            Some(pool) => pool.status().await["workers"].clone(),
            None => json!([]),
        };
        json!({
            "host": self.registry.snapshots(),
            "workers": workers,
        })
    }

    pub async fn shutdown(mut self) {
        self.watcher.take();
        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
        if let Some(server) = self.local_server.take() {
            server.abort();
        }
    }
}
