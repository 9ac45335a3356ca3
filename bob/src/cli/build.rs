// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use clap::Args;
use regex::Regex;
use thiserror::Error;

use bob::builder::{self, DownloadMode, LayerMode, Options};
use bob::graph::GraphDoc;
use bob::{Builder, Project};

use super::Global;

#[derive(Debug, Args)]
#[command(about = "Build packages from a resolved graph")]
pub struct Command {
    #[arg(help = "Packages to build; defaults to the graph roots")]
    packages: Vec<String>,
    #[arg(short, long, default_value = "graph.yaml", help = "Resolved package graph document")]
    graph: String,
    #[arg(short, long, help = "Parallel jobs", default_value_t = 1)]
    jobs: usize,
    #[arg(short, long, help = "Force execution of all build steps")]
    force: bool,
    #[arg(short = 'n', long, help = "Don't build dependencies")]
    no_deps: bool,
    #[arg(short = 'b', long, help = "Don't checkout, only build and package")]
    build_only: bool,
    #[arg(short = 'B', long, help = "Only checkout sources")]
    checkout_only: bool,
    #[arg(short, long, help = "Continue building after errors")]
    keep_going: bool,
    #[arg(long, help = "Clean build workspaces before building")]
    clean: bool,
    #[arg(long, help = "Throw away dirty source workspaces")]
    clean_checkout: bool,
    #[arg(long, help = "Don't generate audit trails")]
    no_audit: bool,
    #[arg(long, help = "Fail instead of moving changed sources to the attic")]
    no_attic: bool,
    #[arg(long, help = "Don't symlink dependencies next to workspaces")]
    no_link_deps: bool,
    #[arg(
        long,
        value_name = "MODE",
        help = "Download mode: no|yes|forced|deps|forced-deps|forced-fallback|packages=RE",
        default_value = "no"
    )]
    download: String,
    #[arg(long, value_name = "MODE=LAYER", help = "Download mode override per layer")]
    download_layer: Vec<String>,
    #[arg(long, help = "Upload built artifacts")]
    upload: bool,
    #[arg(long, value_name = "RE", help = "Always checkout matching packages, ignoring predictions")]
    always_checkout: Vec<String>,
    #[arg(long, help = "Use shared packages")]
    shared: bool,
    #[arg(long, help = "Install shareable packages to the shared location")]
    install_shared: bool,
    #[arg(long, help = "Resume a previously interrupted build")]
    resume: bool,
    #[arg(long = "meta", value_name = "KEY=VALUE", help = "Extra audit metadata")]
    audit_meta: Vec<String>,
}

pub async fn handle(global: &Global, command: Command) -> Result<i32, Error> {
    let project = Project::open(&global.directory)?;

    let graph_text = fs_err::read_to_string(project.path(&command.graph))?;
    let graph = GraphDoc::from_yaml(&graph_text)?.resolve()?;

    let roots = if command.packages.is_empty() {
        graph.roots().to_vec()
    } else {
        command
            .packages
            .iter()
            .map(|name| {
                graph
                    .packages()
                    .find(|p| &p.name == name)
                    .map(|p| p.package)
                    .ok_or_else(|| Error::UnknownPackage(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    let options = options(&command)?;
    let jobs = command.jobs.max(1);
    let builder = Builder::new(project, graph, options);

    let local = tokio::task::LocalSet::new();
    let stats = local
        .run_until(builder.cook(&roots, command.resume))
        .await?;

    println!(
        "Build finished: {} checkout(s), {} package(s) built, {} downloaded, {} job(s)",
        stats.checkouts, stats.packages_built, stats.packages_downloaded, jobs,
    );

    Ok(0)
}

fn options(command: &Command) -> Result<Options, Error> {
    let download = match command.download.as_str() {
        "no" => DownloadMode::No,
        "yes" => DownloadMode::Yes,
        "forced" => DownloadMode::Forced,
        "deps" => DownloadMode::Deps,
        "forced-deps" => DownloadMode::ForcedDeps,
        "forced-fallback" => DownloadMode::ForcedFallback,
        other => match other.strip_prefix("packages=") {
            Some(re) => DownloadMode::Packages(Regex::new(re).map_err(|e| Error::BadRegex(re.to_owned(), e))?),
            None => return Err(Error::BadDownloadMode(other.to_owned())),
        },
    };

    let download_layer_modes = command
        .download_layer
        .iter()
        .map(|entry| {
            let (mode, layer) = entry.split_once('=').ok_or_else(|| Error::BadDownloadMode(entry.clone()))?;
            let mode = match mode {
                "yes" => LayerMode::Yes,
                "no" => LayerMode::No,
                "forced" => LayerMode::Forced,
                _ => return Err(Error::BadDownloadMode(entry.clone())),
            };
            let regex = Regex::new(layer).map_err(|e| Error::BadRegex(layer.to_owned(), e))?;
            Ok((regex, mode))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let always_checkout = command
        .always_checkout
        .iter()
        .map(|re| Regex::new(re).map_err(|e| Error::BadRegex(re.clone(), e)))
        .collect::<Result<Vec<_>, _>>()?;

    let audit_meta = command
        .audit_meta
        .iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.to_owned(), v.to_owned()))
                .ok_or_else(|| Error::BadMeta(entry.clone()))
        })
        .collect::<Result<_, _>>()?;

    Ok(Options {
        force: command.force,
        skip_deps: command.no_deps,
        build_only: command.build_only,
        checkout_only: command.checkout_only,
        keep_going: command.keep_going,
        clean_build: command.clean,
        clean_checkout: command.clean_checkout,
        audit: !command.no_audit,
        attic: !command.no_attic,
        link_deps: !command.no_link_deps,
        jobs: command.jobs.max(1),
        make_fds: std::env::var("MAKEFLAGS")
            .ok()
            .as_deref()
            .and_then(jobserver::makeflags::parse_auth),
        download,
        download_layer_modes,
        upload: command.upload,
        always_checkout,
        use_shared: command.shared,
        install_shared: command.install_shared,
        audit_meta,
    })
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("project")]
    Project(#[from] bob::project::Error),
    #[error("graph")]
    Graph(#[from] bob::graph::Error),
    #[error("unknown package '{0}'")]
    UnknownPackage(String),
    #[error("invalid download mode '{0}'")]
    BadDownloadMode(String),
    #[error("invalid regex '{0}'")]
    BadRegex(String, #[source] regex::Error),
    #[error("invalid meta entry '{0}', expected KEY=VALUE")]
    BadMeta(String),
    #[error(transparent)]
    Build(#[from] builder::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}
