mod args;
mod context;
mod registry;

pub use args::{Args, ParseError, ParseErrorKind, ParseOutcome, parse_env};
pub use context::{Context, EnvContext};
pub use registry::{CommandSpec, FlagSpec, ParamSpec, Registry};
