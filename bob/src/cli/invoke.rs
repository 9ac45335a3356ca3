// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;

use clap::Args;
use thiserror::Error;

use bob::invoker::{InvocationMode, Invoker, StepSpec};

#[derive(Debug, Args)]
#[command(about = "Replay a frozen step spec")]
pub struct Command {
    #[arg(help = "Path to the step.spec file")]
    spec: PathBuf,
    #[arg(short, long, help = "Clean the workspace first")]
    clean: bool,
    #[arg(long, help = "Open an interactive shell instead of running the script")]
    shell: bool,
}

pub async fn handle(command: Command) -> Result<i32, Error> {
    let spec = StepSpec::load(&command.spec)?;
    let invoker = Invoker::new(spec);

    let mode = if command.shell {
        InvocationMode::Shell
    } else {
        InvocationMode::Call
    };

    let code = invoker.execute_step(mode, false, command.clean).await?;

    // Death by signal maps to the usual 128+N shell convention
    Ok(if code < 0 { 128 - code } else { code })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invoke")]
    Invoker(#[from] bob::invoker::Error),
}
