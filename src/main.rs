use std::process::ExitCode;

use clap::Parser;
use tilestack::cli::{self, CliArgs};
use tilestack::logger;

fn main() -> ExitCode {
    let args = CliArgs::parse();

    // Initialize session log (overwrites previous session log)
    logger::init(if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    });

    cli::run(args)
}
