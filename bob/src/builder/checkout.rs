// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The checkout state machine.
//!
//! Brings a source workspace in sync with its SCM specs. Directories
//! that cannot be updated in place are switched or moved to the attic.
//! After every run the tree is rehashed, because the user may have
//! edited the sources at any time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use log::{info, warn};

use crate::digest::Digest;
use crate::dirhash::HashOnce;
use crate::graph::StepId;
use crate::invoker::InvocationMode;
use crate::scm::{self, ScmSpec};
use crate::state::{BuildOnlyState, CheckoutState, DirectoryState, ResultHash, ScmDirState};
use crate::util;

use super::{BuildError, Cook, CookError, CookResult};

/// Tracks directories moved to the attic within one checkout run.
///
/// SCMs nested below an already moved directory traveled with it; the
/// tracker maps their old location into the attic.
#[derive(Default)]
pub(crate) struct AtticTracker {
    paths: Vec<(PathBuf, PathBuf)>,
}

impl AtticTracker {
    pub(crate) fn add(&mut self, scm_path: &Path, attic_path: &Path) {
        self.paths.push((scm_path.to_path_buf(), attic_path.to_path_buf()));
    }

    pub(crate) fn affected(&self, nested: &Path) -> bool {
        self.matching(nested).is_some()
    }

    pub(crate) fn attic_path(&self, nested: &Path) -> Option<PathBuf> {
        let (prefix, attic) = self.matching(nested)?;
        let sub = nested.strip_prefix(prefix).ok()?;
        Some(attic.join(sub))
    }

    fn matching(&self, nested: &Path) -> Option<(&Path, &Path)> {
        self.paths
            .iter()
            .find(|(prefix, _)| nested.starts_with(prefix) && nested != prefix)
            .map(|(prefix, attic)| (prefix.as_path(), attic.as_path()))
    }
}

impl Cook {
    pub(crate) async fn cook_checkout_step(self: &Rc<Self>, step: StepId, _depth: usize) -> CookResult<()> {
        let workspace = self.workspace(step);
        let workspace_abs = self.workspace_abs(step);
        let data = self.graph.step(step);
        let variant_id = self.graph.variant_id(step);

        let created = construct_dir(&workspace_abs)?;
        let mut old_state = self.state.borrow().checkout_state(&workspace);
        let mut is_fresh = !self.state.borrow().has_directory_state(&workspace);
        if created {
            old_state = CheckoutState::default();
            self.state
                .borrow_mut()
                .reset_workspace_state(&workspace, DirectoryState::Checkout(old_state.clone()));
            is_fresh = true;
        }
        let mut old_hash = self.state.borrow().result_hash(&workspace).cloned();

        let input_hashes: Vec<ResultHash> = data
            .all_dep_steps()
            .iter()
            .filter(|&&dep| self.graph.step(dep).is_valid())
            .filter_map(|&dep| {
                let dep_workspace = self.workspace(dep);
                self.state.borrow().result_hash(&dep_workspace).cloned()
            })
            .collect();

        let new_state = self.new_checkout_state(step, &input_hashes);
        let current_hash = HashOnce::new(&workspace_abs);
        let mut executed = false;

        let has_result = self.state.borrow().result_hash(&workspace).is_some();
        if self.opts.build_only && has_result {
            // Build-only: at most an in-place update of local SCMs
            let input_changed = new_state.update_changed(&old_state);
            let updatable = data.update_script.is_some()
                || data.scms.iter().any(|s| scm::from_spec(s).is_local());
            let stored = self.state.borrow().result_hash(&workspace).cloned();
            let may_update = updatable || input_changed || {
                let fresh = current_hash.hash().await.map_err(|e| hash_error(&workspace, e))?;
                stored.as_ref().and_then(ResultHash::digest) != Some(fresh)
            };

            if may_update {
                if new_state.update_compatible(&old_state) {
                    info!("UPDATE {workspace}");
                    self.run_step(step, InvocationMode::Update, created, false).await?;
                    let mut updated = old_state.clone();
                    updated.build_only = new_state.build_only.clone();
                    self.state
                        .borrow_mut()
                        .set_directory_state(&workspace, DirectoryState::Checkout(updated));
                    current_hash.invalidate();
                    executed = true;
                } else {
                    warn!("UPDATE {workspace}: recipe changed - cannot update");
                }
            } else if !new_state.same_checkout(&old_state) {
                warn!("CHECKOUT {workspace}: recipe changed but skipped due to --build-only");
            } else {
                info!("CHECKOUT skipped due to --build-only ({workspace})");
            }
        } else {
            // Dirty SCMs are moved away on clean checkouts
            if self.opts.clean_checkout {
                self.invalidate_dirty_scms(step, &mut old_state, &new_state).await;
            }

            let reason = self
                .checkout_reason(step, created, &old_state, &new_state, &input_hashes, &current_hash)
                .await?;

            if let Some(reason) = reason {
                self.prepare_checkout_dirs(step, &workspace, &workspace_abs, &mut old_state, &new_state)
                    .await?;

                // Without the variant-id the step runs again should it
                // fail after this point.
                let mut partial = new_state.clone();
                partial.variant_id = None;
                self.state
                    .borrow_mut()
                    .set_directory_state(&workspace, DirectoryState::Checkout(partial));

                // Forge the result so dependents rebuild even if this
                // checkout dies half way.
                if self.state.borrow().result_hash(&workspace).is_some() {
                    let poisoned = ResultHash::now();
                    old_hash = Some(poisoned.clone());
                    self.state.borrow_mut().set_result_hash(&workspace, poisoned);
                }

                info!("CHECKOUT {workspace} ({reason})");
                self.run_step(step, InvocationMode::Call, created, false).await?;
                self.stats.borrow_mut().checkouts += 1;
                executed = true;
                current_hash.invalidate();

                let incremental = self.incremental_variant_id(step);
                let mut state = self.state.borrow_mut();
                state.set_directory_state(&workspace, DirectoryState::Checkout(new_state.clone()));
                state.set_input_hashes(&workspace, crate::state::InputState::Plain(input_hashes.clone()));
                state.set_variant_id(&workspace, incremental);
            } else {
                info!("CHECKOUT skipped (fixed package {workspace})");
            }
        }

        // Always rehash: the user may have changed the sources
        let checkout_hash = current_hash.hash().await.map_err(|e| hash_error(&workspace, e))?;

        if old_hash.as_ref().and_then(ResultHash::digest) != Some(checkout_hash) || self.opts.force {
            // The workspace hash IS the checkout's build-id
            self.generate_audit(step, checkout_hash, checkout_hash, executed).await?;
            self.state
                .borrow_mut()
                .set_result_hash(&workspace, checkout_hash.into());
        }

        // Share the live-build-id translation with other builders
        if is_fresh && self.archive.can_upload() && data.has_live_build_id() {
            if let Some(live_id) = self.calc_live_build_id(step).await? {
                if let Err(e) = self.archive.upload_live_build_id(live_id, checkout_hash).await {
                    warn!("cannot upload live build-id: {e}");
                }
            }
        }

        self.set_already_run(step, true, false);

        // A wrong prediction poisons everything derived from it
        let predicted = self
            .src_build_ids
            .borrow()
            .get(&(workspace.clone(), variant_id))
            .copied();
        if let Some((build_id, predicted)) = predicted {
            if build_id != checkout_hash {
                debug_assert!(predicted, "non-predicted incorrect build-id");
                return Err(self.handle_changed_build_id(step, checkout_hash));
            }
        }

        Ok(())
    }

    fn new_checkout_state(&self, step: StepId, input_hashes: &[ResultHash]) -> CheckoutState {
        let data = self.graph.step(step);

        let mut scms = BTreeMap::new();
        for spec in &data.scms {
            let scm = scm::from_spec(spec);
            scms.insert(
                scm.directory().to_owned(),
                ScmDirState {
                    digest: Digest::of(scm.digest_script()),
                    spec: Some(spec.clone()),
                },
            );
        }

        // The directory is part of the locals digest on purpose;
        // existing workspaces were recorded with it.
        let locals = data
            .scms
            .iter()
            .map(scm::from_spec)
            .filter(|scm| scm.is_local())
            .map(|scm| format!("{} {}", scm.directory(), scm.digest_script()))
            .collect::<Vec<_>>()
            .join("\n");

        CheckoutState {
            variant_id: Some(self.graph.variant_id(step)),
            build_only: Some(BuildOnlyState {
                locals,
                update_digest: data.update_script.as_deref().map(Digest::of),
                input_hashes: input_hashes.to_vec(),
            }),
            scms,
        }
    }

    /// Why the checkout must run, or `None` to skip it.
    async fn checkout_reason(
        &self,
        step: StepId,
        created: bool,
        old_state: &CheckoutState,
        new_state: &CheckoutState,
        input_hashes: &[ResultHash],
        current_hash: &HashOnce,
    ) -> CookResult<Option<&'static str>> {
        let workspace = self.workspace(step);
        let data = self.graph.step(step);

        if created {
            return Ok(Some("initial checkout"));
        }
        if self.opts.force {
            return Ok(Some("forced"));
        }
        if !data.deterministic {
            return Ok(Some("indeterministic"));
        }
        if !new_state.same_checkout(old_state) {
            return Ok(Some("recipe changed"));
        }
        let old_inputs = match self.state.borrow().input_hashes(&workspace) {
            Some(crate::state::InputState::Plain(hashes)) => Some(hashes.clone()),
            _ => None,
        };
        if old_inputs.as_deref() != Some(input_hashes) {
            return Ok(Some("dependency changed"));
        }
        if data.script.is_some() {
            let old_hash = self.state.borrow().result_hash(&workspace).cloned();
            let fresh = current_hash.hash().await.map_err(|e| hash_error(&workspace, e))?;
            if old_hash.as_ref().and_then(ResultHash::digest) != Some(fresh) {
                return Ok(Some("workspace changed"));
            }
        }
        Ok(None)
    }

    /// Invalidate dirty SCM directories so they get moved away below.
    async fn invalidate_dirty_scms(&self, step: StepId, old_state: &mut CheckoutState, new_state: &CheckoutState) {
        let ctx = self.scm_context(step);
        let data = self.graph.step(step);
        let scm_map: BTreeMap<&str, &ScmSpec> = data.scms.iter().map(|s| (s.directory(), s)).collect();

        for (dir, old) in old_state.scms.iter_mut() {
            let Some(new) = new_state.scms.get(dir) else {
                continue;
            };
            if old.digest != new.digest {
                continue;
            }
            if !ctx.workspace.join(dir).exists() {
                continue;
            }
            let Some(spec) = scm_map.get(dir.as_str()) else {
                continue;
            };
            if scm::from_spec(spec).status(&ctx).await.dirty() {
                // Poisoned digest forces the attic move
                old.digest = Digest::of(b"dirty");
            }
        }
    }

    /// Move aside or switch every SCM directory that no longer matches
    /// its spec, and guard against collisions with new checkouts.
    async fn prepare_checkout_dirs(
        self: &Rc<Self>,
        step: StepId,
        workspace: &str,
        workspace_abs: &Path,
        old_state: &mut CheckoutState,
        new_state: &CheckoutState,
    ) -> CookResult<()> {
        let data = self.graph.step(step);
        let scm_map: BTreeMap<&str, &ScmSpec> = data.scms.iter().map(|s| (s.directory(), s)).collect();

        let mut attic = AtticTracker::default();
        // Top-down order: outer SCMs move before the ones nested in
        // them.
        let old_dirs: Vec<(String, ScmDirState)> = old_state
            .scms
            .iter()
            .map(|(dir, state)| (dir.clone(), state.clone()))
            .collect();

        for (dir, old) in old_dirs {
            let scm_path = workspace_abs.join(&dir);

            if attic.affected(&scm_path) {
                // Moved along with an enclosing SCM
                if let Some(attic_path) = attic.attic_path(&scm_path) {
                    if attic_path.exists() {
                        if let Some(spec) = old.spec.clone() {
                            self.state
                                .borrow_mut()
                                .set_attic_state(&attic_path.display().to_string(), spec);
                        }
                    }
                }
                old_state.scms.remove(&dir);
                self.state
                    .borrow_mut()
                    .set_directory_state(workspace, DirectoryState::Checkout(old_state.clone()));
                continue;
            }

            if Some(old.digest) == new_state.scms.get(&dir).map(|s| s.digest) {
                continue;
            }

            // Try an in-place switch first
            let mut switched = false;
            if let (Some(new_spec), Some(old_spec)) = (scm_map.get(dir.as_str()), &old.spec) {
                if scm_path.exists() && scm::from_spec(new_spec).can_switch(old_spec) {
                    switched = self.run_scm_switch(step, new_spec, old_spec).await?;
                }
            }

            if switched {
                if let Some(new) = new_state.scms.get(&dir) {
                    old_state.scms.insert(dir.clone(), new.clone());
                    self.state
                        .borrow_mut()
                        .set_directory_state(workspace, DirectoryState::Checkout(old_state.clone()));
                }
                continue;
            }

            if scm_path.exists() {
                if !self.opts.attic {
                    return Err(CookError::Build(BuildError::new(format!(
                        "SCM '{dir}' inline switch not possible and move to attic disabled ({workspace})"
                    ))));
                }

                let attic_name = format!(
                    "{}_{}",
                    util::path_safe_timestamp(),
                    scm_path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
                );
                warn!("ATTIC {} (move to ../attic/{attic_name})", scm_path.display());

                let attic_dir = workspace_abs.parent().expect("workspace parent").join("attic");
                util::ensure_dir_exists(&attic_dir).map_err(|e| hash_error(workspace, e))?;
                let attic_path = attic_dir.join(&attic_name);
                fs_err::rename(&scm_path, &attic_path)
                    .map_err(|e| CookError::Build(BuildError::new("cannot move to attic").with_source(e)))?;

                if let Some(spec) = old.spec.clone() {
                    self.state
                        .borrow_mut()
                        .set_attic_state(&attic_path.display().to_string(), spec);
                }
                attic.add(&scm_path, &attic_path);
            }

            old_state.scms.remove(&dir);
            self.state
                .borrow_mut()
                .set_directory_state(workspace, DirectoryState::Checkout(old_state.clone()));
        }

        // New checkouts must not clobber unrelated files
        for (dir, _) in new_state.scms.iter() {
            if dir.as_str() == "." || old_state.scms.contains_key(dir) {
                continue;
            }
            let scm_path = workspace_abs.join(dir);
            if scm_path.exists() {
                return Err(CookError::Build(BuildError::new(format!(
                    "new SCM checkout '{dir}' collides with existing file in workspace '{workspace}'"
                ))));
            }
        }

        Ok(())
    }

    async fn run_scm_switch(self: &Rc<Self>, step: StepId, new_spec: &ScmSpec, old_spec: &ScmSpec) -> CookResult<bool> {
        info!("SWITCH {}", self.workspace(step));
        let log = self.project.step_dir(&self.workspace(step)).join("log.txt");
        let spec = self.step_spec(step, Some(log));
        let invoker = crate::invoker::Invoker::new(spec);

        match invoker.execute_scm_switch(new_spec, old_spec).await {
            Ok(0) => Ok(true),
            Ok(code) if code == -(nix::sys::signal::Signal::SIGINT as i32) => Err(CookError::Build(
                BuildError::new("user aborted while inline switching SCM").resume_hint(),
            )),
            Ok(_) => Ok(false),
            Err(e) => Err(CookError::Build(
                BuildError::new("SCM switch failed").with_source(e),
            )),
        }
    }

    /// The variant-id with dependency values taken from the workspaces,
    /// so partial builds do not invalidate unrelated consumers.
    pub(crate) fn incremental_variant_id(&self, step: StepId) -> Digest {
        crate::digest::variant_id(&self.graph, step, |dep| {
            let workspace = self.workspace(dep);
            let stored = self.state.borrow().variant_id(&workspace);
            stored.unwrap_or_else(|| self.graph.variant_id(dep))
        })
    }
}

/// Make sure the workspace directory exists. Returns whether it was
/// (re)created.
pub(crate) fn construct_dir(workspace: &Path) -> CookResult<bool> {
    let mut created = false;
    if workspace.is_symlink() || workspace.is_file() {
        // Remnant of a shared package
        util::remove_path(workspace).map_err(|e| construct_error(workspace, e))?;
    }
    if !workspace.is_dir() {
        fs_err::create_dir_all(workspace).map_err(|e| construct_error(workspace, e))?;
        created = true;
    }
    Ok(created)
}

fn construct_error(path: &Path, e: std::io::Error) -> CookError {
    CookError::Build(BuildError::new(format!("cannot create workspace {}", path.display())).with_source(e))
}

fn hash_error(workspace: &str, e: std::io::Error) -> CookError {
    CookError::Build(BuildError::new(format!("cannot hash workspace {workspace}")).with_source(e))
}

#[cfg(test)]
mod attic_test {
    use super::*;

    #[test]
    fn prefix_matching() {
        let mut tracker = AtticTracker::default();
        tracker.add(Path::new("/ws/outer"), Path::new("/ws/../attic/x_outer"));

        assert!(tracker.affected(Path::new("/ws/outer/inner")));
        assert!(!tracker.affected(Path::new("/ws/outer")));
        assert!(!tracker.affected(Path::new("/ws/other")));

        assert_eq!(
            tracker.attic_path(Path::new("/ws/outer/inner")).unwrap(),
            Path::new("/ws/../attic/x_outer/inner")
        );
    }
}
