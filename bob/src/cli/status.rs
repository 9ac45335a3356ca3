// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Args;
use thiserror::Error;

use bob::graph::GraphDoc;
use bob::scm::{self, ScmContext, Status, Taint};
use bob::state::DirectoryState;
use bob::{PersistentState, Project};

use super::Global;

#[derive(Debug, Args)]
#[command(about = "Show the SCM status of all source workspaces")]
pub struct Command {
    #[arg(short, long, default_value = "graph.yaml", help = "Resolved package graph document")]
    graph: String,
    #[arg(short, long, help = "Also show clean workspaces")]
    verbose: bool,
}

pub async fn handle(global: &Global, command: Command) -> Result<i32, Error> {
    let project = Project::open(&global.directory)?;

    let graph_text = fs_err::read_to_string(project.path(&command.graph))?;
    let graph = GraphDoc::from_yaml(&graph_text)?.resolve()?;

    let state = PersistentState::open(&project.root)?;

    for step in graph.steps().filter(|s| s.is_checkout() && s.is_valid()) {
        let Some(dir) = state.existing_by_name_directory(graph.workspace_identity(step.id)) else {
            continue;
        };
        let workspace = format!("{dir}/workspace");
        let workspace_abs = project.path(&workspace);
        let ctx = ScmContext {
            workspace: workspace_abs.clone(),
            project_root: project.root.clone(),
        };

        let known_dirs = match state.directory_state(&workspace) {
            Some(DirectoryState::Checkout(checkout)) => checkout.scms.keys().cloned().collect::<Vec<_>>(),
            _ => vec![],
        };

        for spec in &step.scms {
            let scm = scm::from_spec(spec);
            let mut status = if workspace_abs.join(scm.directory()).exists() {
                scm.status(&ctx).await
            } else {
                let mut status = Status::default();
                status.add(Taint::New, "not checked out yet");
                status
            };
            if !known_dirs.iter().any(|d| d == scm.directory()) && workspace_abs.join(scm.directory()).exists() {
                status.add(Taint::Overridden, "directory not created by this recipe");
            }

            if command.verbose || !status.clean() {
                println!("{status} {workspace}/{}", scm.directory());
                for line in status.description() {
                    println!("    {line}");
                }
            }
        }
    }

    // Displaced checkouts are still reported
    for (path, spec) in state.attic() {
        let mut status = Status::default();
        status.add(Taint::Attic, format!("was {}", spec.directory()));
        println!("{status} {path}");
    }

    state.finalize();
    Ok(0)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("project")]
    Project(#[from] bob::project::Error),
    #[error("graph")]
    Graph(#[from] bob::graph::Error),
    #[error("state")]
    State(#[from] bob::state::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}
