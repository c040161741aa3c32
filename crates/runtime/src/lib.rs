use cmd::Context;

mod serve;
mod watch;
mod worker;

pub use serve::{Host, serve_config};
pub use watch::{WatchGuard, start_watch};
pub use worker::run_worker;

/// Run the host: workers, routing and the public listener.
pub fn serve(context: &Context) {
    serve::serve(context);
}

/// Run a worker process speaking the control protocol on stdin/stdout.
pub fn worker(context: &Context) {
    worker::worker(context);
}
