// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The build state machine.
//!
//! A build workspace is emptied whenever the recipe (or the layout of
//! its inputs) changes and re-run whenever any input hash moved.

use std::rc::Rc;

use log::{info, warn};

use crate::digest::Digest;
use crate::dirhash;
use crate::graph::StepId;
use crate::invoker::InvocationMode;
use crate::state::{DirectoryState, InputState, ResultHash};
use crate::util;

use super::checkout::construct_dir;
use super::{BuildError, Cook, CookError, CookResult};

impl Cook {
    pub(crate) async fn cook_build_step(self: &Rc<Self>, step: StepId, depth: usize, build_id: Digest) -> CookResult<()> {
        let workspace = self.workspace(step);
        let workspace_abs = self.workspace_abs(step);
        let data = self.graph.step(step);
        let sandboxed = data.sandbox.is_some();

        // The exec paths of the step and all dependencies are part of
        // the identity: tools bake input paths into their output, so a
        // path change needs a clean build even though the variant-id is
        // stable.
        let mut build_digest = vec![
            self.incremental_variant_id(step).to_hex(),
            self.result_exec_path(sandboxed, step),
        ];
        for &dep in &data.all_dep_steps() {
            if self.graph.step(dep).is_valid() {
                build_digest.push(self.result_exec_path(sandboxed, dep));
            }
        }

        let mut created = construct_dir(&workspace_abs)?;
        let old_digest = self.state.borrow().directory_state(&workspace).cloned();
        if created || old_digest != Some(DirectoryState::Build(build_digest.clone())) {
            if !created && workspace_abs.exists() {
                warn!("PRUNE {workspace} (recipe changed)");
                util::empty_directory(&workspace_abs)
                    .map_err(|e| CookError::Build(BuildError::new("cannot prune workspace").with_source(e)))?;
                created = true;
            }
            self.state
                .borrow_mut()
                .reset_workspace_state(&workspace, DirectoryState::Build(build_digest.clone()));
        }

        // Inputs: dependency results plus the host fingerprint
        let mut input_hashes: Vec<ResultHash> = vec![];
        for &dep in &data.all_dep_steps() {
            if !self.graph.step(dep).is_valid() {
                continue;
            }
            let dep_workspace = self.workspace(dep);
            if let Some(hash) = self.state.borrow().result_hash(&dep_workspace).cloned() {
                input_hashes.push(hash);
            }
        }
        let fingerprint = self.get_fingerprint(step, depth).await?;
        if !fingerprint.is_empty() {
            input_hashes.push(ResultHash::Hash(Digest(
                fingerprint.as_slice().try_into().expect("20 byte fingerprint"),
            )));
        }

        let unchanged = self.state.borrow().input_hashes(&workspace) == Some(&InputState::Plain(input_hashes.clone()));
        if !self.opts.force && unchanged {
            info!("BUILD skipped (unchanged input for {workspace})");
            // Rehash anyway, the user may have built manually
            if !self.opts.clean_build {
                let hash = dirhash::hash_directory_async(workspace_abs.clone())
                    .await
                    .map_err(|e| CookError::Build(BuildError::new("cannot hash workspace").with_source(e)))?;
                self.state.borrow_mut().set_result_hash(&workspace, hash.into());
            }
            return Ok(());
        }

        // Squash the state first: a failed run must leave nothing that
        // looks valid.
        {
            let mut state = self.state.borrow_mut();
            state.del_input_hashes(&workspace);
            state.set_result_hash(&workspace, ResultHash::now());
        }

        info!("BUILD {workspace}");
        self.run_step(step, InvocationMode::Call, created, self.opts.clean_build).await?;

        let build_hash = dirhash::hash_directory_async(workspace_abs.clone())
            .await
            .map_err(|e| CookError::Build(BuildError::new("cannot hash workspace").with_source(e)))?;
        self.generate_audit(step, build_hash, build_id, true).await?;

        let variant_id = Digest::from_hex(&build_digest[0]).expect("hex variant-id");
        let mut state = self.state.borrow_mut();
        state.set_result_hash(&workspace, build_hash.into());
        state.set_variant_id(&workspace, variant_id);
        state.set_input_hashes(&workspace, InputState::Plain(input_hashes));

        Ok(())
    }
}
