// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The build scheduler.
//!
//! Walks the step graph with a bounded pool of runner permits,
//! deduplicates equivalent work, serializes workspace access and drives
//! the three per-step state machines. Everything runs cooperatively on
//! one thread; filesystem heavy work is pushed to the blocking pool.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use log::warn;
use regex::Regex;
use thiserror::Error;

use crate::archive::MultiArchive;
use crate::digest::Digest;
use crate::graph::{Graph, StepId, StepKind};
use crate::project::Project;
use crate::share::{NullShare, Share};
use crate::state::PersistentState;

mod build;
mod buildid;
mod checkout;
mod fingerprint;
mod invoke;
mod package;
mod task;
#[cfg(test)]
mod test;

pub use self::task::Completion;

/// Practically infinite depth limit.
const NO_DEPTH: usize = 0xffff;

/// How eagerly artifacts are downloaded instead of built.
#[derive(Debug, Clone, Default)]
pub enum DownloadMode {
    #[default]
    No,
    /// Everything, silently falling back to building.
    Yes,
    /// Everything; a miss on the root is an error.
    Forced,
    /// Dependencies only.
    Deps,
    ForcedDeps,
    /// Root must download, dependencies are built.
    ForcedFallback,
    /// Packages matching the expression.
    Packages(Regex),
}

/// Per-layer download override, matched against layer names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerMode {
    Yes,
    No,
    Forced,
}

/// All knobs of one build invocation.
#[derive(Debug, Clone)]
pub struct Options {
    pub force: bool,
    pub skip_deps: bool,
    pub build_only: bool,
    pub checkout_only: bool,
    pub keep_going: bool,
    pub clean_build: bool,
    pub clean_checkout: bool,
    pub audit: bool,
    pub attic: bool,
    pub link_deps: bool,
    pub jobs: usize,
    /// Inherited job-server pipe from an outer make.
    pub make_fds: Option<jobserver::Fds>,
    pub download: DownloadMode,
    pub download_layer_modes: Vec<(Regex, LayerMode)>,
    pub upload: bool,
    pub always_checkout: Vec<Regex>,
    pub use_shared: bool,
    pub install_shared: bool,
    pub audit_meta: BTreeMap<String, String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            force: false,
            skip_deps: false,
            build_only: false,
            checkout_only: false,
            keep_going: false,
            clean_build: false,
            clean_checkout: false,
            audit: true,
            attic: true,
            link_deps: true,
            jobs: 1,
            make_fds: None,
            download: DownloadMode::No,
            download_layer_modes: vec![],
            upload: false,
            always_checkout: vec![],
            use_shared: false,
            install_shared: false,
            audit_meta: BTreeMap::new(),
        }
    }
}

impl Options {
    fn download_depth(&self, can_download: bool) -> usize {
        match &self.download {
            DownloadMode::Yes if can_download => 0,
            DownloadMode::Forced | DownloadMode::ForcedFallback => 0,
            DownloadMode::Deps if can_download => 1,
            DownloadMode::ForcedDeps => 1,
            _ => NO_DEPTH,
        }
    }

    fn download_depth_force(&self) -> usize {
        match &self.download {
            DownloadMode::Forced => 0,
            DownloadMode::ForcedDeps => 1,
            DownloadMode::ForcedFallback => 1,
            _ => NO_DEPTH,
        }
    }

    fn upload_depth(&self) -> usize {
        if self.upload {
            NO_DEPTH
        } else {
            0
        }
    }
}

/// Counters reported after a build.
#[derive(Debug, Default, Clone, Copy)]
pub struct Statistics {
    pub checkouts: usize,
    pub packages_built: usize,
    pub packages_downloaded: usize,
}

/// A failed step, tagged with the package it belongs to.
#[derive(Debug)]
pub struct BuildError {
    pub message: String,
    pub stack: Vec<String>,
    pub help: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl std::error::Error for BuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.source {
            Some(source) => Some(source.as_ref()),
            None => None,
        }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stack.is_empty() {
            write!(f, "{}", self.message)?;
        } else {
            write!(f, "{}: {}", self.stack.join("/"), self.message)?;
        }
        if let Some(help) = &self.help {
            write!(f, " ({help})")?;
        }
        Ok(())
    }
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: vec![],
            help: None,
            source: None,
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    fn set_stack(&mut self, stack: &[String]) {
        if self.stack.is_empty() {
            self.stack = stack.to_vec();
        }
    }

    fn resume_hint(self) -> Self {
        self.with_help("resume with '--resume' to skip already built packages")
    }
}

/// Final outcome of [`Builder::cook`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Build(BuildError),
    #[error("{} errors occurred", .0.len())]
    Multi(Vec<BuildError>),
    #[error("canceled by user! Run again with '--resume' to skip already built packages.")]
    Canceled,
    #[error("state")]
    State(#[from] crate::state::Error),
}

impl Error {
    pub fn errors(&self) -> Vec<&BuildError> {
        match self {
            Error::Build(e) => vec![e],
            Error::Multi(errors) => errors.iter().collect(),
            _ => vec![],
        }
    }
}

/// Control flow of one step task. Build errors are recorded in the
/// shared list before this surfaces, restarts and cancellation carry no
/// payload.
#[derive(Debug)]
pub(crate) enum CookError {
    Build(BuildError),
    Restart,
    Cancel,
}

pub(crate) type CookResult<T> = Result<T, CookError>;

impl From<BuildError> for CookError {
    fn from(e: BuildError) -> Self {
        CookError::Build(e)
    }
}

/// Outcome of one scheduling attempt.
enum Attempt {
    Done,
    Restart,
}

/// Key deduplicating equivalent step tasks.
type TaskKey = (String, Option<Digest>, bool);

pub struct Builder {
    project: Project,
    graph: Rc<Graph>,
    archive: MultiArchive,
    share: Rc<dyn Share>,
    options: Options,
}

impl Builder {
    pub fn new(project: Project, graph: Graph, options: Options) -> Self {
        let archive = MultiArchive::from_config(&project.config.archive, &project.root);
        let share: Rc<dyn Share> = match &project.config.share {
            Some(config) => Rc::new(crate::share::LocalShare::new(project.root.join(&config.path))),
            None => Rc::new(NullShare),
        };

        Self {
            project,
            graph: Rc::new(graph),
            archive,
            share,
            options,
        }
    }

    pub fn with_share(mut self, share: Rc<dyn Share>) -> Self {
        self.share = share;
        self
    }

    pub fn with_archive(mut self, archive: MultiArchive) -> Self {
        self.archive = archive;
        self
    }

    /// Build the requested root steps. Must run inside a
    /// `tokio::task::LocalSet`.
    pub async fn cook(self, roots: &[StepId], resume: bool) -> Result<Statistics, Error> {
        let state = PersistentState::open(&self.project.root)?;

        let cook = Rc::new(Cook::new(self, state));
        if resume {
            cook.load_build_state();
        }

        let mut restarts = 0;
        let result = loop {
            match cook.attempt(roots).await {
                Ok(Attempt::Done) => break Ok(()),
                Ok(Attempt::Restart) if restarts == 0 => {
                    warn!("restarting build due to wrongly predicted sources");
                    restarts += 1;
                }
                Ok(Attempt::Restart) => {
                    // Deliberately capped at a single restart per
                    // invocation.
                    break Err(Error::Build(
                        BuildError::new("build-id prediction still unstable after restart").resume_hint(),
                    ));
                }
                Err(e) => break Err(e),
            }
        };

        cook.save_build_state();

        let stats = *cook.stats.borrow();
        let cook = Rc::try_unwrap(cook).unwrap_or_else(|_| panic!("cook tasks outlived the build"));
        cook.state.into_inner().finalize();

        result.map(|()| stats)
    }
}

/// Shared state of one `cook` invocation (possibly several scheduling
/// attempts).
pub(crate) struct Cook {
    pub(crate) project: Project,
    pub(crate) graph: Rc<Graph>,
    pub(crate) archive: MultiArchive,
    pub(crate) share: Rc<dyn Share>,
    pub(crate) opts: Options,
    pub(crate) state: RefCell<PersistentState>,

    // surviving across attempts
    pub(crate) stats: RefCell<Statistics>,
    was_run: RefCell<HashMap<String, (Digest, bool)>>,
    was_skipped: RefCell<HashMap<String, bool>>,
    download_tried: RefCell<HashSet<String>>,
    /// Checkout build-ids by (workspace, variant-id): value and whether
    /// it is merely predicted.
    pub(crate) src_build_ids: RefCell<HashMap<(String, Digest), (Digest, bool)>>,
    pub(crate) dist_build_ids: RefCell<HashMap<String, Digest>>,
    pub(crate) fingerprints: RefCell<HashMap<Digest, Vec<u8>>>,
    workspaces: RefCell<HashMap<StepId, String>>,
    workspace_locks: RefCell<HashMap<String, Rc<tokio::sync::Mutex<()>>>>,

    // per-attempt scheduling state
    running: Cell<bool>,
    restart: Cell<bool>,
    cancel: tokio::sync::Notify,
    runners: RefCell<Rc<jobserver::Permits>>,
    cook_tasks: RefCell<HashMap<TaskKey, Completion<()>>>,
    build_id_tasks: RefCell<HashMap<TaskKey, Completion<Digest>>>,
    fingerprint_tasks: RefCell<HashMap<Digest, Completion<Vec<u8>>>>,
    errors: RefCell<Vec<BuildError>>,
    tasks: RefCell<Vec<tokio::task::JoinHandle<()>>>,
}

impl Cook {
    fn new(builder: Builder, state: PersistentState) -> Self {
        Self {
            project: builder.project,
            graph: builder.graph,
            archive: builder.archive,
            share: builder.share,
            opts: builder.options,
            state: RefCell::new(state),
            stats: RefCell::new(Statistics::default()),
            was_run: RefCell::new(HashMap::new()),
            was_skipped: RefCell::new(HashMap::new()),
            download_tried: RefCell::new(HashSet::new()),
            src_build_ids: RefCell::new(HashMap::new()),
            dist_build_ids: RefCell::new(HashMap::new()),
            fingerprints: RefCell::new(HashMap::new()),
            workspaces: RefCell::new(HashMap::new()),
            workspace_locks: RefCell::new(HashMap::new()),
            running: Cell::new(true),
            restart: Cell::new(false),
            cancel: tokio::sync::Notify::new(),
            runners: RefCell::new(Rc::new(jobserver::Permits::counting(1))),
            cook_tasks: RefCell::new(HashMap::new()),
            build_id_tasks: RefCell::new(HashMap::new()),
            fingerprint_tasks: RefCell::new(HashMap::new()),
            errors: RefCell::new(Vec::new()),
            tasks: RefCell::new(Vec::new()),
        }
    }

    /// One scheduling attempt over all roots.
    async fn attempt(self: &Rc<Self>, roots: &[StepId]) -> Result<Attempt, Error> {
        self.running.set(true);
        self.restart.set(false);
        self.cook_tasks.borrow_mut().clear();
        self.build_id_tasks.borrow_mut().clear();
        self.fingerprint_tasks.borrow_mut().clear();

        let runners = if self.opts.jobs <= 1 {
            jobserver::Permits::counting(1)
        } else if let Some(fds) = self.opts.make_fds {
            // Safety: inherited fds are owned by us per the make
            // job-server protocol.
            unsafe { jobserver::Permits::external(fds.read, fds.write) }
                .map_err(|e| Error::Build(BuildError::new("cannot join job server").with_source(e)))?
        } else {
            jobserver::Permits::owned(self.opts.jobs)
                .map_err(|e| Error::Build(BuildError::new("cannot create job server").with_source(e)))?
        };
        *self.runners.borrow_mut() = Rc::new(runners);

        self.state.borrow_mut().set_async();

        // Cancellation on Ctrl-C
        let sigint = {
            let this = self.clone();
            tokio::task::spawn_local(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("canceling all running jobs...");
                    this.cancel_all();
                }
            })
        };

        let checkout_only = self.opts.checkout_only;
        let root_tasks: Vec<_> = roots
            .iter()
            .map(|&root| {
                let this = self.clone();
                tokio::task::spawn_local(async move {
                    let result = this.cook_root(root, checkout_only).await;
                    if let Err(e) = result {
                        this.record_failure(None, e);
                    }
                })
            })
            .collect();

        for task in root_tasks {
            let _ = task.await;
        }

        sigint.abort();
        let _ = sigint.await;

        // Reap stragglers; their results are already in the error list.
        let pending: Vec<_> = self.tasks.borrow_mut().drain(..).collect();
        for task in pending {
            task.abort();
            let _ = task.await;
        }

        self.state.borrow_mut().set_sync();

        if self.restart.get() {
            return Ok(Attempt::Restart);
        }

        let mut errors: Vec<BuildError> = self.errors.borrow_mut().drain(..).collect();
        match errors.len() {
            0 => {
                if self.running.get() {
                    Ok(Attempt::Done)
                } else {
                    Err(Error::Canceled)
                }
            }
            1 => Err(Error::Build(errors.pop().expect("one error"))),
            _ => Err(Error::Multi(errors)),
        }
    }

    async fn cook_root(self: &Rc<Self>, root: StepId, checkout_only: bool) -> CookResult<()> {
        self.acquire_runner().await?;
        let result = self.cook_steps(&[root], self.graph.step(root).package, checkout_only, 0).await;
        self.release_runner();
        result
    }

    // -- cancellation & bookkeeping -----------------------------------

    pub(crate) fn cancel_all(&self) {
        self.running.set(false);
        self.cancel.notify_waiters();
    }

    pub(crate) fn check_running(&self) -> CookResult<()> {
        if self.running.get() {
            Ok(())
        } else {
            Err(CookError::Cancel)
        }
    }

    fn record_failure(&self, step: Option<StepId>, error: CookError) {
        match error {
            CookError::Build(mut e) => {
                if let Some(step) = step {
                    e.set_stack(&self.graph.package_of(step).stack);
                }
                if !self.opts.keep_going {
                    self.cancel_all();
                }
                self.errors.borrow_mut().push(e);
            }
            CookError::Restart => {
                if self.running.get() {
                    self.restart.set(true);
                    self.cancel_all();
                }
            }
            CookError::Cancel => {}
        }
    }

    // -- runner permits -----------------------------------------------

    pub(crate) async fn acquire_runner(&self) -> CookResult<()> {
        let runners = self.runners.borrow().clone();
        tokio::select! {
            _ = self.cancel.notified() => return Err(CookError::Cancel),
            result = runners.acquire() => {
                result.map_err(|e| CookError::Build(BuildError::new("job server failed").with_source(e)))?;
            }
        }
        if !self.running.get() {
            // Raced with cancellation; give the permit back
            runners.release();
            return Err(CookError::Cancel);
        }
        Ok(())
    }

    pub(crate) fn release_runner(&self) {
        self.runners.borrow().release();
    }

    /// Release the runner permit while awaiting `fut`, so recursive
    /// waits cannot starve the pool, then take it back.
    pub(crate) async fn yield_job_while<T>(&self, fut: impl std::future::Future<Output = T>) -> CookResult<T> {
        self.release_runner();
        let ret = fut.await;
        // Re-acquire unconditionally to keep the permit balanced, even
        // when the build is being canceled.
        let runners = self.runners.borrow().clone();
        if runners.acquire().await.is_err() {
            return Err(CookError::Cancel);
        }
        self.check_running()?;
        Ok(ret)
    }

    // -- workspaces ---------------------------------------------------

    /// Project-relative workspace path of a step, allocated on first
    /// use.
    ///
    /// The directory is keyed by package identity, not by variant-id:
    /// it stays put when recipes change, which is what lets the
    /// prune/switch/attic machinery react to the change instead of
    /// silently building in a fresh location.
    pub(crate) fn workspace(&self, step: StepId) -> String {
        if let Some(path) = self.workspaces.borrow().get(&step) {
            return path.clone();
        }
        let data = self.graph.step(step);
        let base = self.graph.base_dir(step).display().to_string();
        let identity = self.graph.workspace_identity(step);
        let dir = self
            .state
            .borrow_mut()
            .by_name_directory(&base, identity, data.is_checkout());
        let path = format!("{dir}/workspace");
        self.workspaces.borrow_mut().insert(step, path.clone());
        path
    }

    /// Absolute workspace path on the host.
    pub(crate) fn workspace_abs(&self, step: StepId) -> PathBuf {
        self.project.path(self.workspace(step))
    }

    /// Path of the step result as the executing script sees it.
    pub(crate) fn exec_path(&self, step: StepId) -> String {
        let data = self.graph.step(step);
        if data.sandbox.is_some() {
            format!("/bob/{}", self.workspace(step))
        } else {
            self.storage_abs(step).display().to_string()
        }
    }

    /// Physical location of the step result (shared packages live
    /// outside the workspace tree).
    pub(crate) fn storage_abs(&self, step: StepId) -> PathBuf {
        let workspace = self.workspace(step);
        let storage = self.state.borrow().storage_path(&workspace);
        self.project.path(storage)
    }

    pub(crate) fn workspace_lock(&self, workspace: &str) -> Rc<tokio::sync::Mutex<()>> {
        self.workspace_locks
            .borrow_mut()
            .entry(workspace.to_owned())
            .or_insert_with(|| Rc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    // -- was-run tracking ---------------------------------------------

    pub(crate) fn was_already_run(&self, step: StepId, skipped_ok: bool) -> bool {
        let workspace = self.workspace(step);
        let mut was_run = self.was_run.borrow_mut();
        match was_run.get(&workspace) {
            Some((digest, _)) if *digest != self.graph.variant_id(step) => {
                // stale entry from a different variant
                was_run.remove(&workspace);
                false
            }
            Some(_) => skipped_ok || !self.was_skipped.borrow().get(&workspace).copied().unwrap_or(false),
            None => false,
        }
    }

    pub(crate) fn set_already_run(&self, step: StepId, is_checkout: bool, skipped: bool) {
        let workspace = self.workspace(step);
        self.was_run
            .borrow_mut()
            .insert(workspace.clone(), (self.graph.variant_id(step), is_checkout));
        self.was_skipped.borrow_mut().insert(workspace, skipped);
    }

    /// Forget build- and package-steps, keeping checkout knowledge.
    pub(crate) fn clear_was_run(&self) {
        self.was_run.borrow_mut().retain(|_, (_, is_checkout)| *is_checkout);
    }

    pub(crate) fn was_download_tried(&self, workspace: &str) -> bool {
        self.download_tried.borrow().contains(workspace)
    }

    pub(crate) fn set_download_tried(&self, workspace: &str) {
        self.download_tried.borrow_mut().insert(workspace.to_owned());
    }

    pub(crate) fn clear_download_tried(&self) {
        self.download_tried.borrow_mut().clear();
    }

    // -- resume state -------------------------------------------------

    fn save_build_state(&self) {
        let was_skipped = self.was_skipped.borrow();
        let was_run = self
            .was_run
            .borrow()
            .iter()
            // skipped steps were not really executed
            .filter(|(path, _)| !was_skipped.get(*path).copied().unwrap_or(false))
            .map(|(path, entry)| (path.clone(), *entry))
            .collect();

        let predicted_build_ids = self
            .src_build_ids
            .borrow()
            .iter()
            .filter(|(_, (_, predicted))| *predicted)
            .map(|((path, vid), (bid, _))| (format!("{path}/{vid}"), *bid))
            .collect();

        self.state.borrow_mut().set_build_state(crate::state::BuildState {
            was_run,
            predicted_build_ids,
        });
    }

    fn load_build_state(&self) {
        let saved = self.state.borrow().build_state();
        *self.was_run.borrow_mut() = saved.was_run.into_iter().collect();

        let mut src = self.src_build_ids.borrow_mut();
        for (key, bid) in saved.predicted_build_ids {
            let Some((path, vid)) = key.rsplit_once('/') else {
                continue;
            };
            let Some(vid) = Digest::from_hex(vid) else {
                continue;
            };
            src.insert((path.to_owned(), vid), (bid, true));
        }
    }

    // -- task scheduling ----------------------------------------------

    /// Cook several sibling steps, deduplicating against concurrently
    /// running tasks. The caller holds a runner permit which is yielded
    /// while waiting.
    pub(crate) async fn cook_steps(
        self: &Rc<Self>,
        steps: &[StepId],
        parent: crate::graph::PackageId,
        checkout_only: bool,
        depth: usize,
    ) -> CookResult<()> {
        let steps: Vec<StepId> = steps
            .iter()
            .copied()
            .filter(|&s| !self.opts.skip_deps || self.graph.step(s).package == parent)
            .filter(|&s| self.graph.step(s).is_valid() && !self.was_already_run(s, checkout_only))
            .collect();
        if steps.is_empty() {
            return Ok(());
        }

        let completions: Vec<Completion<()>> = steps
            .iter()
            .map(|&step| self.spawn_cook_task(step, checkout_only, depth))
            .collect();

        let results = self
            .yield_job_while(futures_util::future::join_all(
                completions.iter().map(|c| c.wait()),
            ))
            .await?;

        if results.iter().any(Result::is_err) {
            return Err(CookError::Cancel);
        }
        Ok(())
    }

    fn task_key(&self, step: StepId, checkout_only: bool) -> TaskKey {
        let sandbox = self
            .graph
            .step(step)
            .sandbox
            .as_ref()
            .map(|s| self.graph.variant_id(s.step));
        (self.workspace(step), sandbox, checkout_only)
    }

    fn spawn_cook_task(self: &Rc<Self>, step: StepId, checkout_only: bool, depth: usize) -> Completion<()> {
        let key = self.task_key(step, checkout_only);
        if let Some(task) = self.cook_tasks.borrow().get(&key) {
            return task.clone();
        }

        // A task for the same step with the other checkout-only flavor
        // must finish first; the two would race on the workspace.
        let fence = self
            .cook_tasks
            .borrow()
            .get(&(key.0.clone(), key.1, !checkout_only))
            .cloned();

        let completion = Completion::new();
        self.cook_tasks.borrow_mut().insert(key.clone(), completion.clone());

        let this = self.clone();
        let task = completion.clone();
        let handle = tokio::task::spawn_local(async move {
            if let Some(fence) = fence {
                let _ = fence.wait().await;
            }
            match this.cook_step(step, checkout_only, depth).await {
                Ok(()) => {
                    // Only successful tasks leave the tracker; failed
                    // ones stay so every waiter observes the failure.
                    this.cook_tasks.borrow_mut().remove(&key);
                    task.complete(Ok(()));
                }
                Err(e) => {
                    this.record_failure(Some(step), e);
                    task.complete(Err(task::TaskFailed));
                }
            }
        });
        self.tasks.borrow_mut().push(handle);

        completion
    }

    /// One step, dispatched by kind. Runs with a runner permit held.
    async fn cook_step(self: &Rc<Self>, step: StepId, checkout_only: bool, depth: usize) -> CookResult<()> {
        self.acquire_runner().await?;
        let result = self.cook_step_inner(step, checkout_only, depth).await;
        self.release_runner();
        result
    }

    async fn cook_step_inner(self: &Rc<Self>, step: StepId, checkout_only: bool, depth: usize) -> CookResult<()> {
        self.check_running()?;

        let data = self.graph.step(step);
        if !data.is_valid() || self.was_already_run(step, checkout_only) {
            return Ok(());
        }

        match data.kind {
            StepKind::Checkout => {
                self.cook_steps(&data.all_dep_steps(), data.package, false, depth + 1).await?;
                let lock = self.workspace_lock(&self.workspace(step));
                let _guard = lock.lock().await;
                if !self.was_already_run(step, checkout_only) {
                    self.cook_checkout_step(step, depth).await?;
                }
            }
            StepKind::Build => {
                self.cook_steps(&data.all_dep_steps(), data.package, checkout_only, depth + 1).await?;
                let lock = self.workspace_lock(&self.workspace(step));
                let _guard = lock.lock().await;
                if !self.was_already_run(step, checkout_only) {
                    if !checkout_only {
                        let build_id = self.get_build_id(step, depth).await?;
                        self.cook_build_step(step, depth, build_id).await?;
                    }
                    self.set_already_run(step, false, checkout_only);
                }
            }
            StepKind::Package => {
                self.cook_package(step, checkout_only, depth).await?;
            }
        }

        Ok(())
    }
}
