// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Args;
use thiserror::Error;

use bob::layers::LayerManager;
use bob::{PersistentState, Project};

use super::Global;

#[derive(Debug, Args)]
#[command(about = "Manage recipe layers")]
pub struct Command {
    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    #[command(about = "Check out or update all configured layers")]
    Update,
}

pub async fn handle(global: &Global, command: Command) -> Result<i32, Error> {
    let project = Project::open(&global.directory)?;

    match command.subcommand {
        Subcommand::Update => {
            let mut state = PersistentState::open(&project.root)?;
            let result = LayerManager::new(&project).update(&mut state).await;
            state.finalize();
            result?;
        }
    }

    Ok(0)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("project")]
    Project(#[from] bob::project::Error),
    #[error("state")]
    State(#[from] bob::state::Error),
    #[error(transparent)]
    Layers(#[from] bob::layers::Error),
}
