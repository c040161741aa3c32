use cmd::{CommandSpec, Context, Registry};

const COMMAND: CommandSpec = CommandSpec {
    name: "worker",
    category: "internal",
    summary: "host environments for a parent envmux process",
    aliases: &[],
    handler: run,
};

pub fn register(registry: &mut Registry) {
    registry.add_command(COMMAND);
}

pub fn run(context: &Context) {
    runtime::worker(context);
}
