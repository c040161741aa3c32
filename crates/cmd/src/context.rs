use std::collections::HashMap;
use std::path::PathBuf;

use crate::args::{Args, ParseError, parse_env};
use crate::registry::Registry;

#[derive(Debug, Clone)]
pub struct Context {
    pub args: Args,
    pub env: EnvContext,
}

#[derive(Debug, Clone)]
pub struct EnvContext {
    pub vars: HashMap<String, String>,
    pub cwd: PathBuf,
}

impl EnvContext {
    pub fn load() -> Self {
        let vars = std::env::vars().collect::<HashMap<_, _>>();
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { vars, cwd }
    }
}

impl Context {
    pub fn from_env(registry: &Registry) -> Result<Self, Vec<ParseError>> {
        let parsed = parse_env(registry);
        if !parsed.errors.is_empty() {
            return Err(parsed.errors);
        }
        Ok(Self {
            args: parsed.args,
            env: EnvContext::load(),
        })
    }

    pub fn flag(&self, name: &str) -> bool {
        self.args.flags.contains_key(name)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.args.params.get(name).map(String::as_str)
    }

    /// First positional argument after the command, resolved against cwd.
    pub fn path_arg(&self) -> Option<PathBuf> {
        self.args.positionals.first().map(|raw| {
            let path = PathBuf::from(raw);
            if path.is_absolute() {
                path
            } else {
                self.env.cwd.join(path)
            }
        })
    }
}
