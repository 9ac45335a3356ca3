// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

mod build;
mod invoke;
mod layers;
mod status;

#[derive(Debug, Parser)]
#[command(name = "bob", about = "Recipe driven, reproducible builds")]
pub struct Command {
    #[command(flatten)]
    pub global: Global,
    #[command(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(Debug, clap::Args)]
pub struct Global {
    #[arg(
        short = 'C',
        long = "directory",
        help = "Project root directory",
        global = true,
        default_value = "."
    )]
    pub directory: PathBuf,
}

#[derive(Debug, clap::Subcommand)]
pub enum Subcommand {
    Build(build::Command),
    Status(status::Command),
    Layers(layers::Command),
    #[command(hide = true)]
    Invoke(invoke::Command),
}

/// Process all CLI arguments. Returns the process exit code.
pub async fn process() -> Result<i32, Error> {
    let Command { global, subcommand } = Command::parse();

    match subcommand {
        Subcommand::Build(command) => build::handle(&global, command).await.map_err(Error::Build),
        Subcommand::Status(command) => status::handle(&global, command).await.map_err(Error::Status),
        Subcommand::Layers(command) => layers::handle(&global, command).await.map_err(Error::Layers),
        Subcommand::Invoke(command) => invoke::handle(command).await.map_err(Error::Invoke),
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("build")]
    Build(#[source] build::Error),

    #[error("status")]
    Status(#[source] status::Error),

    #[error("layers")]
    Layers(#[source] layers::Error),

    #[error("invoke")]
    Invoke(#[source] invoke::Error),
}
