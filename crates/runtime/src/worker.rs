use std::sync::Arc;

use cmd::Context;
use engine::{
    BuiltinLoader, EnvironmentRegistry, ErrorRenderer, ModuleLoader, ReloadController,
    WorkerOptions,
};
use http::{Interceptor, NegotiateOptions, OutboundClient, environment_router, negotiate};
use serde_json::{Value, json};
use stdio as stdio_log;
use tokio::io::{AsyncRead, AsyncWrite};
use transport::{ChannelOptions, CustomEvent, Frame, RpcChannel, StreamFilter, WireMessage};

pub fn worker(_context: &Context) {
    stdio_log::init_tracing();
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            stdio_log::error("worker", &format!("failed to start tokio runtime: {}", err));
            std::process::exit(1);
        }
    };

    let options = WorkerOptions::from_env();
    let base_dir = std::env::current_dir().unwrap_or_else(|_| ".".into());
    let loader: Arc<dyn ModuleLoader> = Arc::new(BuiltinLoader::new(base_dir));
    let result = rt.block_on(run_worker(
        options,
        loader,
        tokio::io::stdin(),
        tokio::io::stdout(),
    ));
    if let Err(err) = result {
        stdio_log::error("worker", &err);
        std::process::exit(1);
    }
}

/// Serve environments registered over the control channel until it closes.
///
/// The worker reports its negotiated listener as an untagged
/// `listen-address`, echoes each `env-register` once the environment is
/// registered, records tagged `listen-address` announcements as remotes and
/// reloads on `full-reload`.
pub async fn run_worker<R, W>(
    options: WorkerOptions,
    loader: Arc<dyn ModuleLoader>,
    reader: R,
    writer: W,
) -> Result<(), String>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (channel, mut frames) = RpcChannel::spawn_subscribed(
        reader,
        writer,
        ChannelOptions {
            default_timeout: options.rpc_timeout(),
            label: options.label.clone(),
        },
        StreamFilter::Any,
    );

    let registry = Arc::new(EnvironmentRegistry::new(
        loader,
        options.runner_options(),
        ErrorRenderer::new(options.dev),
    ));
    let client = OutboundClient::new().map_err(|err| err.to_string())?;
    let interceptor = Arc::new(Interceptor::new(Arc::clone(&registry), client));
    if let Err(err) = http::install(Arc::clone(&interceptor)) {
        tracing::debug!("[{}] interceptor not installed: {}", options.label, err);
    }
    let reload = ReloadController::new(Arc::clone(&registry));
    register_operations(&channel, &registry, &reload);

    let listener = negotiate(
        &NegotiateOptions::new(&options.socket_dir, &options.label).force_tcp(options.force_tcp),
    )
    .await?;
    let address = listener.address().clone();
    let server = tokio::spawn(listener.serve(environment_router(Arc::clone(&registry))));
    channel
        .send_control(WireMessage::listen_address(address.clone()), None)
        .map_err(|err| format!("Failed to report listen address: {}", err))?;
    tracing::info!("[{}] listening on {}", options.label, address);

    while let Some(frame) = frames.recv().await {
        handle_frame(&channel, &registry, &interceptor, &reload, frame);
    }

    tracing::debug!("[{}] control channel closed", options.label);
    server.abort();
    Ok(())
}

fn handle_frame(
    channel: &RpcChannel,
    registry: &EnvironmentRegistry,
    interceptor: &Interceptor,
    reload: &ReloadController,
    frame: Frame,
) {
    match (&frame.payload, frame.tag()) {
        (WireMessage::Custom(CustomEvent::EnvRegister(register)), _) => {
            let registration = registry.register(&register.name, &register.entry);
            if !registration.is_created() {
                tracing::debug!("{} already registered", register.name);
            }
            let echo = WireMessage::env_register(&register.name, &register.entry);
            if let Err(err) = channel.send_control(echo, None) {
                tracing::warn!("could not confirm {}: {}", register.name, err);
            }
        }
        (WireMessage::Custom(CustomEvent::ListenAddress(address)), Some(name)) => {
            tracing::debug!("{} is served at {}", name, address);
            interceptor.set_remote(name, address.clone());
        }
        (WireMessage::FullReload, _) => {
            let reload = reload.clone();
            let frame = frame.clone();
            tokio::spawn(async move {
                if let Some(summary) = reload.handle(&frame).await {
                    for failed in summary.failed() {
                        let message = failed.error.as_deref().unwrap_or("unknown error");
                        stdio_log::error("reload", &format!("{}: {}", failed.name, message));
                    }
                }
            });
        }
        _ => {
            tracing::trace!("ignoring frame {:?}", frame.payload);
        }
    }
}

fn register_operations(
    channel: &RpcChannel,
    registry: &Arc<EnvironmentRegistry>,
    reload: &ReloadController,
) {
    let status_registry = Arc::clone(registry);
    channel.register_operation("status", move |_data| {
        let registry = Arc::clone(&status_registry);
        async move {
            serde_json::to_value(registry.snapshots()).map_err(|err| err.to_string())
        }
    });

    let reload = reload.clone();
    channel.register_operation("reload", move |data: Value| {
        let reload = reload.clone();
        async move {
            match data.get("name").and_then(Value::as_str) {
                Some(name) => {
                    let outcome = reload
                        .reload_one(name)
                        .await
                        .ok_or_else(|| format!("Unknown environment: {}", name))?;
                    serde_json::to_value(outcome).map_err(|err| err.to_string())
                }
                None => {
                    let summary = reload.reload_all().await;
                    Ok(json!({ "ok": summary.is_ok(), "outcomes": summary.outcomes }))
                }
            }
        }
    });
}
