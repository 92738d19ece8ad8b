// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

mod args;
mod run;

use clap::Parser;
use tracing::level_filters::LevelFilter;

use crate::args::{Cli, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    let level = match args.verbosity.log_level() {
        Some(level) => level.as_str().parse::<LevelFilter>()?,
        None => LevelFilter::OFF,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let verbosity = i32::from(level >= LevelFilter::INFO) + i32::from(level >= LevelFilter::DEBUG);

    match args.command {
        Command::Run(run_args) => run::run(run_args, verbosity).await?,
    }

    Ok(())
}
