use crate::cli::GustProcessCli;
use clap::Parser;

/// Initialise the CLI and logging for a suite binary.
pub fn init() -> GustProcessCli {
    env_logger::init();

    GustProcessCli::parse()
}
