// Copyright (c) 2023-2024 Cloudflare, Inc.
// Licensed under the BSD-3-Clause license found in the LICENSE file or at https://opensource.org/licenses/BSD-3-Clause

pub(crate) mod run;

use clap::{Parser, Subcommand};

use crate::args::run::RunArgs;

/// qos measures the quality of a network path by exchanging authenticated
/// UDP probes with measurement sites chosen by a coordinator, and prints the
/// coordinator's verdict.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub verbosity: clap_verbosity_flag::Verbosity,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ask the coordinator for a test configuration, probe the sites it
    /// names and print the processed results as JSON.
    Run(RunArgs),
}
