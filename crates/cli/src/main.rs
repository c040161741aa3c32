use cmd::Registry;

mod cli;

fn main() {
    let mut registry = Registry::new();
    cli::register_global_flags(&mut registry);
    cli::register_global_params(&mut registry);
    cli::serve::register(&mut registry);
    cli::worker::register(&mut registry);

    cli::execute(&registry);
}
