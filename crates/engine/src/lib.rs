pub mod builtin;
pub mod config;
pub mod error;
pub mod error_page;
pub mod module;
pub mod registry;
pub mod reload;
pub mod runner;

pub use builtin::{BuiltinLoader, StaticSite};
pub use config::{EnvironmentConfig, RouteConfig, RuntimeConfig, WorkerOptions, is_truthy};
pub use error::{EnvError, HandlerError, LoadError, panic_message};
pub use error_page::{DiagnosticRenderer, ErrorRenderer, HtmlDiagnostics, RenderMode};
pub use module::{
    FetchHandler, FnHandler, HttpRequest, HttpResponse, MapLoader, Module, ModuleLoader,
    handler_fn,
};
pub use registry::{EnvironmentRegistry, Registration};
pub use reload::{ReloadController, ReloadSummary};
pub use runner::{
    Backoff, BackoffPolicy, EnvironmentRunner, ReloadOutcome, RunnerOptions, RunnerSnapshot,
    RunnerState,
};
