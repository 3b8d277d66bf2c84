use crate::cmd::{init_logger, Args};
use anyhow::Result;
use clap::Parser;

mod cmd;

/// Returning the `anyhow::Result` lets the runtime print the full error
/// chain on failure and set the exit code.
fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level);
    cmd::run(args)
}
