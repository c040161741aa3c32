use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::runner::{BackoffPolicy, RunnerOptions};

pub const DEFAULT_PORT: u16 = 8530;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub server: ServerConfig,
    pub rpc: RpcConfig,
    pub ready: ReadyConfig,
    pub watch: WatchConfig,
    #[serde(rename = "environment")]
    pub environments: Vec<EnvironmentConfig>,
    #[serde(rename = "route")]
    pub routes: Vec<RouteConfig>,
    /// Directory of the config file; relative entries resolve against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Emit diagnostic error pages instead of the generic one.
    pub dev: bool,
    pub socket_dir: Option<PathBuf>,
    /// Skip the domain-socket probe and always use loopback TCP.
    pub force_tcp: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_ms: u64,
    /// How long the host waits for a new worker to report its address.
    pub listen_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReadyConfig {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    pub serve_stale_on_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub enabled: bool,
    pub paths: Vec<PathBuf>,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    pub entry: String,
    /// Run in a dedicated worker process (default) or inside the host.
    #[serde(default = "default_true")]
    pub isolate: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    pub environment: String,
}

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "*".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            rpc: RpcConfig::default(),
            ready: ReadyConfig::default(),
            watch: WatchConfig::default(),
            environments: Vec::new(),
            routes: Vec::new(),
            base_dir: PathBuf::from("."),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            dev: false,
            socket_dir: None,
            force_tcp: false,
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            listen_timeout_ms: 10_000,
        }
    }
}

impl Default for ReadyConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_attempts: 5,
            serve_stale_on_error: false,
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            paths: Vec::new(),
            debounce_ms: 50,
        }
    }
}

impl RuntimeConfig {
    /// Load from an explicit path or the first config file found.
    ///
    /// Environment overrides are applied on top, then the result is validated.
    pub fn load(explicit: Option<&Path>) -> Result<Self, String> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => Self::find_config_path().ok_or_else(|| {
                "No envmux.toml found (set ENVMUX_CONFIG or pass a path)".to_string()
            })?,
        };
        let contents = std::fs::read_to_string(&path)
            .map_err(|err| format!("Failed to read {}: {}", path.display(), err))?;
        let mut config = Self::parse(&contents)
            .map_err(|err| format!("Failed to parse {}: {}", path.display(), err))?;

        config.base_dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        config.apply_env_overrides_with(&|key| std::env::var(key).ok());
        config.validate()?;
        tracing::debug!(
            "loaded {} ({} environments, {} routes)",
            path.display(),
            config.environments.len(),
            config.routes.len()
        );
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn apply_env_overrides_with<F>(&mut self, env_get: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = env_get("PORT").and_then(|value| value.parse().ok()) {
            self.server.port = port;
        }
        if env_truthy_with("ENVMUX_DEV", env_get) {
            self.server.dev = true;
        }
        if env_truthy_with("ENVMUX_WATCH", env_get) {
            self.watch.enabled = true;
        }
        if env_truthy_with("ENVMUX_FORCE_TCP", env_get) {
            self.server.force_tcp = true;
        }
        if let Some(dir) = env_get("ENVMUX_SOCKET_DIR") {
            self.server.socket_dir = Some(PathBuf::from(dir));
        }
        if let Some(timeout) = env_get("ENVMUX_RPC_TIMEOUT_MS").and_then(|value| value.parse().ok())
        {
            self.rpc.timeout_ms = timeout;
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.environments.is_empty() {
            return Err("No environments configured".to_string());
        }
        let mut names = HashSet::new();
        for env in &self.environments {
            if env.name.trim().is_empty() {
                return Err("Environment name must not be empty".to_string());
            }
            if !names.insert(env.name.as_str()) {
                return Err(format!("Duplicate environment name: {}", env.name));
            }
        }
        for route in &self.routes {
            if !names.contains(route.environment.as_str()) {
                return Err(format!(
                    "Route {} {} targets unknown environment: {}",
                    route.method, route.path, route.environment
                ));
            }
        }
        if self.ready.max_attempts == 0 {
            return Err("ready.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.ready.base_delay_ms),
                max_attempts: self.ready.max_attempts,
            },
            serve_stale_on_error: self.ready.serve_stale_on_error,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.timeout_ms)
    }

    pub fn socket_dir(&self) -> PathBuf {
        self.server
            .socket_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn watch_paths(&self) -> Vec<PathBuf> {
        if self.watch.paths.is_empty() {
            return vec![self.base_dir.clone()];
        }
        self.watch
            .paths
            .iter()
            .map(|path| {
                if path.is_absolute() {
                    path.clone()
                } else {
                    self.base_dir.join(path)
                }
            })
            .collect()
    }

    fn find_config_path() -> Option<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(path) = std::env::var("ENVMUX_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            tracing::warn!("ENVMUX_CONFIG set but file not found: {}", path.display());
        }

        candidates.push(PathBuf::from("envmux.toml"));
        candidates.push(PathBuf::from(".envmux.toml"));

        if let Some(path) = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        {
            candidates.push(path.join("envmux").join("config.toml"));
        }

        candidates.into_iter().find(|path| path.exists())
    }
}

/// Settings handed to a worker process through its environment.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    pub label: String,
    pub socket_dir: PathBuf,
    pub force_tcp: bool,
    pub dev: bool,
    pub rpc_timeout_ms: u64,
    pub ready_base_delay_ms: u64,
    pub ready_max_attempts: u32,
    pub serve_stale_on_error: bool,
}

impl WorkerOptions {
    pub fn for_worker(config: &RuntimeConfig, label: &str) -> Self {
        Self {
            label: label.to_string(),
            socket_dir: config.socket_dir(),
            force_tcp: config.server.force_tcp,
            dev: config.server.dev,
            rpc_timeout_ms: config.rpc.timeout_ms,
            ready_base_delay_ms: config.ready.base_delay_ms,
            ready_max_attempts: config.ready.max_attempts,
            serve_stale_on_error: config.ready.serve_stale_on_error,
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_with(&|key| std::env::var(key).ok())
    }

    pub fn from_env_with<F>(env_get: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = RuntimeConfig::default();
        Self {
            label: env_get("ENVMUX_WORKER_LABEL").unwrap_or_else(|| "worker".to_string()),
            socket_dir: env_get("ENVMUX_SOCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            force_tcp: env_truthy_with("ENVMUX_FORCE_TCP", env_get),
            dev: env_truthy_with("ENVMUX_DEV", env_get),
            rpc_timeout_ms: env_get("ENVMUX_RPC_TIMEOUT_MS")
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.rpc.timeout_ms),
            ready_base_delay_ms: env_get("ENVMUX_READY_BASE_MS")
                .and_then(|value| value.parse().ok())
                .unwrap_or(defaults.ready.base_delay_ms),
            ready_max_attempts: env_get("ENVMUX_READY_ATTEMPTS")
                .and_then(|value| value.parse().ok())
                .filter(|attempts| *attempts > 0)
                .unwrap_or(defaults.ready.max_attempts),
            serve_stale_on_error: env_truthy_with("ENVMUX_SERVE_STALE", env_get),
        }
    }

    pub fn to_env(&self) -> Vec<(String, String)> {
        let flag = |value: bool| if value { "1" } else { "0" }.to_string();
        vec![
            ("ENVMUX_WORKER_LABEL".to_string(), self.label.clone()),
            (
                "ENVMUX_SOCKET_DIR".to_string(),
                self.socket_dir.to_string_lossy().to_string(),
            ),
            ("ENVMUX_FORCE_TCP".to_string(), flag(self.force_tcp)),
            ("ENVMUX_DEV".to_string(), flag(self.dev)),
            (
                "ENVMUX_RPC_TIMEOUT_MS".to_string(),
                self.rpc_timeout_ms.to_string(),
            ),
            (
                "ENVMUX_READY_BASE_MS".to_string(),
                self.ready_base_delay_ms.to_string(),
            ),
            (
                "ENVMUX_READY_ATTEMPTS".to_string(),
                self.ready_max_attempts.to_string(),
            ),
            ("ENVMUX_SERVE_STALE".to_string(), flag(self.serve_stale_on_error)),
        ]
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.ready_base_delay_ms),
                max_attempts: self.ready_max_attempts,
            },
            serve_stale_on_error: self.serve_stale_on_error,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

pub fn env_truthy_with<F>(var: &str, env_get: &F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    env_get(var).map(|value| is_truthy(&value)).unwrap_or(false)
}

pub fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes" | "on")
}
