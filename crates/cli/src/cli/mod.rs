use std::collections::BTreeMap;

use cmd::{Context, FlagSpec, ParamSpec, ParseError, Registry};
use stdio::{error as stdio_error, raw};

pub mod serve;
pub mod worker;

pub fn register_global_flags(registry: &mut Registry) {
    registry.add_flag(FlagSpec {
        name: "--help",
        aliases: &["-H", "help"],
        description: "show help",
    });
    registry.add_flag(FlagSpec {
        name: "--version",
        aliases: &["-V", "version"],
        description: "show version",
    });
    registry.add_flag(FlagSpec {
        name: "--verbose",
        aliases: &[],
        description: "show build metadata with --version",
    });
    registry.add_flag(FlagSpec {
        name: "--debug",
        aliases: &["-d"],
        description: "enable debug logging",
    });
    registry.add_flag(FlagSpec {
        name: "--dev",
        aliases: &[],
        description: "detailed error pages and file watching",
    });
    registry.add_flag(FlagSpec {
        name: "--watch",
        aliases: &["-w"],
        description: "reload environments when files change",
    });
}

pub fn register_global_params(registry: &mut Registry) {
    registry.add_param(ParamSpec {
        name: "--port",
        description: "public port",
    });
}

// provide helpful info if no args are provided
pub fn help(registry: &Registry) {
    raw("Usage: envmux [options] [command] [config]");
    raw(&format!(
        "envmux v{} - one server, many environments",
        env!("CARGO_PKG_VERSION")
    ));
    raw("");

    let dim = "\x1b[2m";
    let reset = "\x1b[0m";

    let mut grouped: BTreeMap<&str, Vec<&cmd::CommandSpec>> = BTreeMap::new();
    for command in registry.commands() {
        grouped.entry(command.category).or_default().push(command);
    }

    for (category, commands) in grouped {
        raw(&format!("{dim}{category}{reset}"));
        for command in commands {
            raw(&format!("  {}\t\t{}", command.name, command.summary));
        }
        raw("");
    }

    raw(&format!("{dim}flags{reset}"));
    for flag in registry.flags() {
        raw(&format!("  {}\t\t{}", flag.name, flag.description));
    }
    for param in registry.params() {
        raw(&format!("  {} <value>\t{}", param.name, param.description));
    }
    raw("");
}

pub fn version(verbose: bool) {
    raw(&format!("envmux [version {}]", env!("CARGO_PKG_VERSION")));
    if verbose {
        raw(&format!("git_sha: {}", env!("ENVMUX_GIT_SHA")));
        raw(&format!("target: {}", env!("ENVMUX_TARGET")));
    }
}

pub fn error(msg: Option<&str>) {
    stdio_error(
        "cli",
        msg.unwrap_or("instructions unclear. try '--help' for guidance"),
    );
}

fn format_parse_errors(errors: &[ParseError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn execute(registry: &Registry) {
    let context = match Context::from_env(registry) {
        Ok(context) => context,
        Err(errors) => {
            error(Some(format_parse_errors(&errors).as_str()));
            std::process::exit(2);
        }
    };

    if context.flag("--debug") {
        // Read once by stdio; workers inherit it from the environment.
        unsafe {
            std::env::set_var("LOG_LEVEL", "debug");
        }
    }

    if context.args.commands.is_empty() {
        if context.flag("--version") {
            version(context.flag("--verbose"));
        } else {
            help(registry);
        }
        return;
    }

    if context.flag("--help") {
        help(registry);
        return;
    }

    if !registry.dispatch(&context) {
        error(None);
        std::process::exit(2);
    }
}
