pub mod client;
mod error;
pub mod interceptor;
pub mod listener;
pub mod router;
mod server;

pub use client::OutboundClient;
pub use error::FetchError;
pub use interceptor::{
    ENV_HEADER, FetchInit, FetchInput, Interceptor, LOCAL_ORIGIN, MarkerSource, Target, fetch,
    install, installed,
};
pub use listener::{NegotiateOptions, NegotiatedListener, negotiate, socket_name, socket_supported};
pub use router::{
    Dispatcher, RouteEntry, RouteMatch, RoutePattern, RouteTable, app_router, environment_router,
};
pub use server::{bind_http, serve_http};
