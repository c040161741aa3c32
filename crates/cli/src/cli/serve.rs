use cmd::{CommandSpec, Context, Registry};

const COMMAND: CommandSpec = CommandSpec {
    name: "serve",
    category: "runtime",
    summary: "serve the environments in envmux.toml",
    aliases: &["start"],
    handler: run,
};

pub fn register(registry: &mut Registry) {
    registry.add_command(COMMAND);
}

pub fn run(context: &Context) {
    runtime::serve(context);
}
