use clap::Parser;
use gosling::Registry;
use gosling_cli::{init_tracing, run, CliArgs};

fn main() {
    // Parse first so that --help works without a database.
    let args = CliArgs::parse();
    init_tracing(args.verbose);

    if let Err(e) = run(args, &Registry::new()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
