//! Host-side supervision of worker processes.
//!
//! Each worker is a child process speaking the RPC transport over its
//! stdin/stdout. Startup goes:
//! - host sends `env-register` for every environment assigned to the worker
//! - worker echoes each registration and reports its `listen-address`
//! - once every worker is up, the host tells each worker where every other
//!   environment lives (`listen-address` tagged with the environment name)

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use engine::EnvironmentConfig;
use futures_util::future::join_all;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use transport::{
    CallOptions, ChannelOptions, CustomEvent, Frame, RpcChannel, StreamFilter, WireMessage,
    WorkerAddress,
};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Executable started for each worker (normally the current binary).
    pub program: PathBuf,
    pub args: Vec<String>,
    pub current_dir: PathBuf,
    /// Extra environment variables for every worker.
    pub env: Vec<(String, String)>,
    pub rpc_timeout: Duration,
    /// How long a new worker has to register and report its address.
    pub listen_timeout: Duration,
}

impl PoolConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string()],
            current_dir: PathBuf::from("."),
            env: Vec::new(),
            rpc_timeout: transport::DEFAULT_CALL_TIMEOUT,
            listen_timeout: Duration::from_secs(10),
        }
    }
}

/// The environments one worker process hosts.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub label: String,
    pub environments: Vec<EnvironmentConfig>,
}

impl WorkerSpec {
    pub fn single(env: EnvironmentConfig) -> Self {
        Self {
            label: env.name.clone(),
            environments: vec![env],
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.environments.iter().map(|env| env.name.clone()).collect()
    }
}

pub struct WorkerHandle {
    pub id: usize,
    pub label: String,
    pub environments: Vec<String>,
    pub address: WorkerAddress,
    channel: RpcChannel,
    child: Mutex<Option<Child>>,
}

impl WorkerHandle {
    pub fn channel(&self) -> &RpcChannel {
        &self.channel
    }

    pub fn hosts(&self, name: &str) -> bool {
        self.environments.iter().any(|env| env == name)
    }

    pub fn is_alive(&self) -> bool {
        !self.channel.is_closed()
    }
}

/// Wait for a worker to echo every registration and report its address.
///
/// Returns the address and the subscription, which keeps receiving the
/// worker's later frames. Frames read before this call are missed; use
/// [`handshake_with`] with a subscription taken at spawn time instead.
pub async fn handshake(
    channel: &RpcChannel,
    environments: &[EnvironmentConfig],
    timeout: Duration,
) -> Result<(WorkerAddress, mpsc::UnboundedReceiver<Frame>), String> {
    let frames = channel.subscribe(StreamFilter::Any);
    handshake_with(channel, frames, environments, timeout).await
}

/// [`handshake`] over an existing `StreamFilter::Any` subscription.
pub async fn handshake_with(
    channel: &RpcChannel,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    environments: &[EnvironmentConfig],
    timeout: Duration,
) -> Result<(WorkerAddress, mpsc::UnboundedReceiver<Frame>), String> {
    for env in environments {
        channel
            .send_control(WireMessage::env_register(&env.name, &env.entry), None)
            .map_err(|err| format!("Failed to register {}: {}", env.name, err))?;
    }

    let mut pending: HashSet<&str> = environments.iter().map(|env| env.name.as_str()).collect();
    let mut address: Option<WorkerAddress> = None;
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if pending.is_empty() {
            if let Some(address) = address.take() {
                return Ok((address, frames));
            }
        }
        let frame = match tokio::time::timeout_at(deadline, frames.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                return Err(format!(
                    "[{}] worker exited during registration",
                    channel.label()
                ));
            }
            Err(_) => {
                let mut waiting: Vec<&str> = pending.iter().copied().collect();
                waiting.sort_unstable();
                if address.is_none() {
                    waiting.push("listen-address");
                }
                return Err(format!(
                    "[{}] worker did not finish registration within {}ms (waiting on {})",
                    channel.label(),
                    timeout.as_millis(),
                    waiting.join(", ")
                ));
            }
        };
        match (&frame.payload, frame.tag()) {
            (WireMessage::Custom(CustomEvent::EnvRegister(register)), _) => {
                pending.remove(register.name.as_str());
            }
            (WireMessage::Custom(CustomEvent::ListenAddress(reported)), None) => {
                address = Some(reported.clone());
            }
            _ => {}
        }
    }
}

pub struct WorkerPool {
    workers: Vec<Arc<WorkerHandle>>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Spawn every worker, wait for all handshakes, then cross-announce
    /// addresses. `extra` lists environments served elsewhere (e.g. by
    /// the host itself) that workers should also be told about.
    pub async fn start(
        config: PoolConfig,
        specs: Vec<WorkerSpec>,
        extra: &[(String, WorkerAddress)],
    ) -> Result<Self, String> {
        tracing::info!("starting {} worker process(es)", specs.len());
        let spawned = join_all(
            specs
                .into_iter()
                .enumerate()
                .map(|(id, spec)| spawn_worker(&config, id, spec)),
        )
        .await;

        let mut workers = Vec::with_capacity(spawned.len());
        let mut failures = Vec::new();
        for result in spawned {
            match result {
                Ok(worker) => workers.push(worker),
                Err(err) => failures.push(err),
            }
        }
        let pool = Self { workers, config };
        if !failures.is_empty() {
            pool.shutdown().await;
            return Err(failures.join("; "));
        }
        pool.announce(extra);
        Ok(pool)
    }

    /// Build a pool from already-connected workers.
    pub(crate) fn from_workers(config: PoolConfig, workers: Vec<Arc<WorkerHandle>>) -> Self {
        Self { workers, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn workers(&self) -> &[Arc<WorkerHandle>] {
        &self.workers
    }

    /// Environment name to the address of the worker serving it.
    pub fn addresses(&self) -> HashMap<String, WorkerAddress> {
        let mut addresses = HashMap::new();
        for worker in &self.workers {
            for env in &worker.environments {
                addresses.insert(env.clone(), worker.address.clone());
            }
        }
        addresses
    }

    fn announce(&self, extra: &[(String, WorkerAddress)]) {
        let mut directory: Vec<(usize, String, WorkerAddress)> = Vec::new();
        for worker in &self.workers {
            for env in &worker.environments {
                directory.push((worker.id, env.clone(), worker.address.clone()));
            }
        }
        for worker in &self.workers {
            let others = directory
                .iter()
                .filter(|(owner, ..)| *owner != worker.id)
                .map(|(_, env, address)| (env, address))
                .chain(extra.iter().map(|(env, address)| (env, address)));
            for (env, address) in others {
                let message = WireMessage::listen_address(address.clone());
                if let Err(err) = worker.channel.send_control(message, Some(env.clone())) {
                    tracing::warn!("[{}] could not announce {}: {}", worker.label, env, err);
                }
            }
        }
    }

    /// Send `full-reload` to every worker, or only to the worker hosting
    /// `tag` when one is given.
    pub fn full_reload(&self, tag: Option<&str>) -> usize {
        let mut sent = 0;
        for worker in &self.workers {
            if let Some(name) = tag {
                if !worker.hosts(name) {
                    continue;
                }
            }
            match worker
                .channel
                .send_control(WireMessage::FullReload, tag.map(str::to_string))
            {
                Ok(()) => sent += 1,
                Err(err) => tracing::warn!("[{}] reload signal failed: {}", worker.label, err),
            }
        }
        sent
    }

    /// Ask every worker for its environment snapshots.
    pub async fn status(&self) -> Value {
        let timeout = self.config.rpc_timeout;
        let replies = join_all(self.workers.iter().map(|worker| async move {
            let reply = worker
                .channel
                .call("status", Value::Null, CallOptions::timeout(timeout))
                .await;
            match reply {
                Ok(value) => json!({ "worker": worker.label, "alive": true, "status": value }),
                Err(err) => json!({
                    "worker": worker.label,
                    "alive": worker.is_alive(),
                    "error": err.to_string(),
                }),
            }
        }))
        .await;
        json!({ "workers": replies })
    }

    /// Reload one environment through its worker and wait for the outcome.
    pub async fn reload_env(&self, name: &str) -> Result<Value, String> {
        let worker = self
            .workers
            .iter()
            .find(|worker| worker.hosts(name))
            .ok_or_else(|| format!("No worker hosts environment {}", name))?;
        worker
            .channel
            .call(
                "reload",
                json!({ "name": name }),
                CallOptions::timeout(self.config.rpc_timeout),
            )
            .await
            .map_err(|err| err.to_string())
    }

    pub async fn shutdown(&self) {
        for worker in &self.workers {
            worker.channel.close();
            let child = worker
                .child
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(mut child) = child {
                if let Err(err) = child.kill().await {
                    tracing::debug!("[{}] kill failed: {}", worker.label, err);
                }
            }
        }
    }
}

async fn spawn_worker(
    config: &PoolConfig,
    id: usize,
    spec: WorkerSpec,
) -> Result<Arc<WorkerHandle>, String> {
    let mut command = Command::new(&config.program);
    command
        .args(&config.args)
        .current_dir(&config.current_dir)
        .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .env("ENVMUX_WORKER_LABEL", &spec.label)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    let mut child = command
        .spawn()
        .map_err(|err| format!("Failed to spawn worker {}: {}", spec.label, err))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| format!("Worker {} has no stdin", spec.label))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| format!("Worker {} has no stdout", spec.label))?;

    let (channel, frames) = RpcChannel::spawn_subscribed(
        stdout,
        stdin,
        ChannelOptions {
            default_timeout: config.rpc_timeout,
            label: spec.label.clone(),
        },
        StreamFilter::Any,
    );
    let handshake =
        handshake_with(&channel, frames, &spec.environments, config.listen_timeout).await;
    let (address, frames) = match handshake {
        Ok(result) => result,
        Err(err) => {
            channel.close();
            let _ = child.kill().await;
            return Err(err);
        }
    };
    tracing::info!(
        "[{}] worker {} up at {} ({})",
        spec.label,
        child.id().unwrap_or_default(),
        address,
        spec.names().join(", ")
    );

    let worker = Arc::new(WorkerHandle {
        id,
        label: spec.label.clone(),
        environments: spec.names(),
        address,
        channel,
        child: Mutex::new(Some(child)),
    });
    watch_worker(Arc::clone(&worker), frames);
    Ok(worker)
}

/// Log what a worker reports after startup and notice when it goes away.
fn watch_worker(worker: Arc<WorkerHandle>, mut frames: mpsc::UnboundedReceiver<Frame>) {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame.payload {
                WireMessage::Custom(CustomEvent::ListenAddress(address)) => {
                    tracing::debug!("[{}] re-reported address {}", worker.label, address);
                }
                WireMessage::Custom(CustomEvent::EnvRegister(register)) => {
                    tracing::debug!("[{}] registered {}", worker.label, register.name);
                }
                other => tracing::trace!("[{}] frame {:?}", worker.label, other),
            }
        }
        tracing::warn!("[{}] worker channel closed", worker.label);
    });
}
