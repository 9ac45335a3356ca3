// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The package state machine.
//!
//! A package result can come into existence four ways: pointed at an
//! already shared location, downloaded from an archive, built locally,
//! or (as a follow-up) installed into the shared location. The decision
//! cascade runs under the workspace lock except for the recursive
//! build-id computation.

use std::rc::Rc;

use log::{info, warn};

use crate::digest::Digest;
use crate::dirhash;
use crate::graph::StepId;
use crate::invoker::InvocationMode;
use crate::state::{DirectoryState, InputState, ResultHash};
use crate::util;

use super::checkout::construct_dir;
use super::{BuildError, Cook, CookError, CookResult, LayerMode};

impl Cook {
    pub(crate) async fn cook_package(self: &Rc<Self>, step: StepId, checkout_only: bool, depth: usize) -> CookResult<()> {
        let workspace = self.workspace(step);
        let data = self.graph.step(step);

        self.prepare_package_step(step)?;

        // Recursive, so computed without holding the workspace lock.
        let build_id = if checkout_only {
            None
        } else {
            Some(self.get_build_id(step, depth).await?)
        };

        // Use an existing shared package
        let mut audit = None;
        let mut shared = false;
        if let Some(build_id) = build_id {
            (shared, audit) = self.use_shared_package(step, build_id)?;
            if shared {
                self.set_already_run(step, false, checkout_only);
            }
        }

        // Download, at most once per invocation per workspace
        let mut downloaded = false;
        if !shared && !checkout_only {
            let build_id = build_id.expect("build-id unless checkout-only");
            let lock = self.workspace_lock(&workspace);
            let _guard = lock.lock().await;
            if !self.was_download_tried(&workspace) {
                (downloaded, audit) = self.download_package(step, depth, build_id).await?;
                self.set_download_tried(&workspace);
                if downloaded {
                    self.set_already_run(step, false, checkout_only);
                }
            }
        }

        // Build locally
        let mut built = false;
        if !shared && !downloaded {
            self.cook_steps(&data.all_dep_steps(), data.package, checkout_only, depth + 1).await?;
            let lock = self.workspace_lock(&workspace);
            let _guard = lock.lock().await;
            if !self.was_already_run(step, checkout_only) {
                if !checkout_only {
                    let build_id = build_id.expect("build-id unless checkout-only");
                    (built, audit) = self.cook_package_step(step, depth, build_id).await?;
                }
                self.set_already_run(step, false, checkout_only);
            }
        }

        // Publish the freshly built artifact
        if built && self.archive.can_upload() && depth <= self.opts.upload_depth() {
            if let (Some(audit), Some(build_id)) = (&audit, build_id) {
                info!("UPLOAD {workspace}");
                self.archive
                    .upload_package(build_id, audit, &self.storage_abs(step))
                    .await
                    .map_err(|e| CookError::Build(BuildError::new("artifact upload failed").with_source(e)))?;
            }
        }

        // Move the content to the shared location
        if !shared && (downloaded || built) {
            if let Some(build_id) = build_id {
                self.install_shared_package(step, build_id)?;
            }
        }

        Ok(())
    }

    /// Erase whatever a previous variant left in the workspace.
    fn prepare_package_step(&self, step: StepId) -> CookResult<()> {
        let workspace = self.workspace(step);
        let workspace_abs = self.workspace_abs(step);
        let variant_id = self.graph.variant_id(step);

        let old_variant = match self.state.borrow().directory_state(&workspace) {
            Some(DirectoryState::Package(digest)) => Some(*digest),
            _ => None,
        };
        let mut something_there = workspace_abs.symlink_metadata().is_ok();

        if something_there && old_variant != Some(variant_id) {
            warn!("PRUNE {workspace} (recipe changed)");
            if workspace_abs.is_symlink() || workspace_abs.is_file() {
                util::remove_path(&workspace_abs).map_err(|e| prune_error(&workspace, e))?;
            } else {
                util::empty_directory(&workspace_abs).map_err(|e| prune_error(&workspace, e))?;
            }
            something_there = false;
        }

        if !something_there {
            self.state
                .borrow_mut()
                .reset_workspace_state(&workspace, DirectoryState::Package(variant_id));
        }

        Ok(())
    }

    /// Point the workspace at an existing shared package, if any.
    ///
    /// Sharing is aggressive: when a shared copy exists it always wins,
    /// duplicate local workspaces are pruned to save space.
    fn use_shared_package(&self, step: StepId, build_id: Digest) -> CookResult<(bool, Option<std::path::PathBuf>)> {
        let data = self.graph.step(step);
        let workspace = self.workspace(step);
        let workspace_abs = self.workspace_abs(step);
        let audit_path = self.project.audit_path(&workspace);
        let variant_id = self.graph.variant_id(step);

        let old_input = self.state.borrow().input_hashes(&workspace).cloned();
        let old_was_shared = old_input.as_ref().is_some_and(InputState::was_shared);

        let shared = if data.shared && self.opts.use_shared {
            self.share.use_shared_package(build_id)
        } else {
            None
        };

        let Some((shared_path, shared_hash)) = shared else {
            // No sharing possible; whatever happens next uses the real
            // workspace as storage.
            self.state.borrow_mut().set_storage_path(&workspace, &workspace);
            if old_was_shared {
                warn!("PRUNE {workspace} (unshare)");
                util::remove_path(&workspace_abs).map_err(|e| prune_error(&workspace, e))?;
                util::remove_path(&audit_path).map_err(|e| prune_error(&workspace, e))?;
                self.state
                    .borrow_mut()
                    .reset_workspace_state(&workspace, DirectoryState::Package(variant_id));
            }
            return Ok((false, None));
        };

        let shared_workspace = shared_path.join("workspace");
        let shared_audit = shared_path.join("audit.json.gz");
        let shared_location = shared_path.display().to_string();

        if old_was_shared && old_input.as_ref().and_then(|i| i.shared_location()) == Some(shared_location.as_str()) {
            info!("PACKAGE skipped (already shared in {workspace})");
            self.state
                .borrow_mut()
                .set_storage_path(&workspace, &shared_workspace.display().to_string());
            return Ok((true, Some(shared_audit)));
        }

        if old_was_shared {
            warn!("PRUNE {workspace} (shared location changed)");
        } else if workspace_abs.exists() {
            warn!("PRUNE {workspace} (use shared package)");
        }
        util::remove_path(&workspace_abs).map_err(|e| prune_error(&workspace, e))?;
        util::remove_path(&audit_path).map_err(|e| prune_error(&workspace, e))?;
        self.state
            .borrow_mut()
            .reset_workspace_state(&workspace, DirectoryState::Package(variant_id));

        info!("SHARE {workspace}");
        util::ensure_dir_exists(workspace_abs.parent().expect("workspace parent"))
            .map_err(|e| prune_error(&workspace, e))?;
        std::os::unix::fs::symlink(&shared_workspace, &workspace_abs).map_err(|e| prune_error(&workspace, e))?;
        std::os::unix::fs::symlink(&shared_audit, &audit_path).map_err(|e| prune_error(&workspace, e))?;

        let mut state = self.state.borrow_mut();
        state.set_result_hash(&workspace, shared_hash.into());
        state.set_variant_id(&workspace, variant_id);
        state.set_input_hashes(
            &workspace,
            InputState::Shared {
                build_id,
                location: shared_location,
            },
        );
        state.set_storage_path(&workspace, &shared_workspace.display().to_string());

        Ok((true, Some(shared_audit)))
    }

    /// Try to fetch the artifact from the archives.
    async fn download_package(
        self: &Rc<Self>,
        step: StepId,
        depth: usize,
        build_id: Digest,
    ) -> CookResult<(bool, Option<std::path::PathBuf>)> {
        let package = self.graph.package_of(step);
        let layer_mode = package.layer.as_deref().and_then(|layer| {
            self.opts
                .download_layer_modes
                .iter()
                .find(|(re, _)| re.is_match(layer))
                .map(|(_, mode)| *mode)
        });

        let try_download = layer_mode != Some(LayerMode::No)
            && (depth >= self.opts.download_depth(self.archive.can_download())
                || matches!(&self.opts.download, super::DownloadMode::Packages(re) if re.is_match(&package.name))
                || layer_mode.is_some());
        if !try_download || !self.archive.can_download() {
            return Ok((false, None));
        }

        let workspace = self.workspace(step);
        let workspace_abs = self.workspace_abs(step);
        let variant_id = self.graph.variant_id(step);
        construct_dir(&workspace_abs)?;

        let old_input = self.state.borrow().input_hashes(&workspace).cloned();
        let old_was_downloaded = old_input.as_ref().is_some_and(InputState::was_downloaded);
        let old_build_id = old_input.as_ref().and_then(InputState::build_id);
        let audit_path = self.project.audit_path(&workspace);

        // Prune when the expected artifact changed
        let prune_reason = if old_build_id.is_some() && old_build_id != Some(build_id) {
            Some("build-id changed")
        } else if self.opts.force {
            Some("build forced")
        } else {
            None
        };
        if let Some(reason) = prune_reason {
            warn!("PRUNE {workspace} ({reason})");
            util::empty_directory(&workspace_abs).map_err(|e| prune_error(&workspace, e))?;
            self.state
                .borrow_mut()
                .reset_workspace_state(&workspace, DirectoryState::Package(variant_id));
        }

        if self.state.borrow().result_hash(&workspace).is_none() {
            let fetched = self
                .archive
                .download_package(build_id, &audit_path, &workspace_abs)
                .await
                .map_err(|e| CookError::Build(BuildError::new("artifact download failed").with_source(e)))?;

            if fetched {
                info!("DOWNLOAD {workspace}");
                self.stats.borrow_mut().packages_downloaded += 1;
                let hash = dirhash::hash_directory_async(workspace_abs.clone())
                    .await
                    .map_err(|e| CookError::Build(BuildError::new("cannot hash workspace").with_source(e)))?;
                let mut state = self.state.borrow_mut();
                state.set_result_hash(&workspace, hash.into());
                state.set_variant_id(&workspace, variant_id);
                state.set_input_hashes(&workspace, InputState::Downloaded { build_id });
                return Ok((true, Some(audit_path)));
            }

            if layer_mode == Some(LayerMode::Forced) {
                return Err(CookError::Build(BuildError::new(format!(
                    "downloading artifact of layer {} failed",
                    package.layer.as_deref().unwrap_or("?")
                ))));
            }
            if depth >= self.opts.download_depth_force() {
                return Err(CookError::Build(BuildError::new("downloading artifact failed")));
            }
            return Ok((false, None));
        }

        if old_was_downloaded {
            info!("PACKAGE skipped (already downloaded in {workspace})");
            return Ok((true, Some(audit_path)));
        }

        Ok((false, None))
    }

    /// Run the package script.
    async fn cook_package_step(
        self: &Rc<Self>,
        step: StepId,
        depth: usize,
        build_id: Digest,
    ) -> CookResult<(bool, Option<std::path::PathBuf>)> {
        let workspace = self.workspace(step);
        let workspace_abs = self.workspace_abs(step);
        let data = self.graph.step(step);
        let package = self.graph.package_of(step);

        construct_dir(&workspace_abs)?;

        // The checkout result is an input even when the build step is
        // the only direct consumer: package scripts may reach across.
        let mut inputs: Vec<StepId> = vec![];
        if let Some(checkout) = package.checkout {
            if self.graph.step(checkout).is_valid() {
                inputs.push(checkout);
            }
        }
        for dep in data.all_dep_steps() {
            if self.graph.step(dep).is_valid() && !inputs.contains(&dep) {
                inputs.push(dep);
            }
        }

        let mut input_hashes: Vec<ResultHash> = vec![];
        for dep in inputs {
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

        let old_inputs = self.state.borrow().input_hashes(&workspace).cloned();
        let unchanged = match &old_inputs {
            Some(InputState::Built { build_id: old, inputs }) => {
                *old == build_id && *inputs == input_hashes
            }
            _ => false,
        };

        if !self.opts.force && unchanged {
            info!("PACKAGE skipped (unchanged input for {workspace})");
            return Ok((false, Some(self.project.audit_path(&workspace))));
        }

        // Invalidate: the workspace is about to be cleared
        {
            let mut state = self.state.borrow_mut();
            state.del_input_hashes(&workspace);
            state.set_result_hash(&workspace, ResultHash::now());
        }

        info!("PACKAGE {workspace}");
        self.run_step(step, InvocationMode::Call, true, true).await?;

        let package_hash = dirhash::hash_directory_async(workspace_abs.clone())
            .await
            .map_err(|e| CookError::Build(BuildError::new("cannot hash workspace").with_source(e)))?;
        let audit = self.generate_audit(step, package_hash, build_id, true).await?;
        self.stats.borrow_mut().packages_built += 1;

        let incremental = self.incremental_variant_id(step);
        {
            let mut state = self.state.borrow_mut();
            state.set_result_hash(&workspace, package_hash.into());
            state.set_variant_id(&workspace, incremental);
            state.set_input_hashes(
                &workspace,
                InputState::Built {
                    build_id,
                    inputs: input_hashes,
                },
            );
        }

        Ok((true, audit))
    }

    /// Install a freshly created package into the shared location.
    fn install_shared_package(&self, step: StepId, build_id: Digest) -> CookResult<()> {
        let data = self.graph.step(step);
        if !self.opts.install_shared || !data.shared || !self.share.can_install() {
            return Ok(());
        }

        let workspace = self.workspace(step);
        let workspace_abs = self.workspace_abs(step);
        let audit_path = self.project.audit_path(&workspace);

        // A missing audit trail would break transitively; such packages
        // are not shared (nor uploaded).
        if !audit_path.exists() {
            info!("INSTALL skipped (no audit trail)");
            return Ok(());
        }

        let Some(result_hash) = self
            .state
            .borrow()
            .result_hash(&workspace)
            .and_then(ResultHash::digest)
        else {
            return Ok(());
        };

        info!("INSTALL {workspace} to {}", self.share.remote_name(build_id));
        let (shared_path, installed) = self
            .share
            .install_shared_package(&workspace_abs, &audit_path, build_id, result_hash)
            .map_err(|e| CookError::Build(BuildError::new("cannot install shared package").with_source(e)))?;
        if !installed {
            info!("INSTALL skipped (package already installed)");
        }

        if self.opts.use_shared {
            // Replace the local copy with pointers to the shared one
            let shared_workspace = shared_path.join("workspace");
            let shared_audit = shared_path.join("audit.json.gz");
            util::remove_path(&workspace_abs).map_err(|e| prune_error(&workspace, e))?;
            util::remove_path(&audit_path).map_err(|e| prune_error(&workspace, e))?;
            util::ensure_dir_exists(workspace_abs.parent().expect("workspace parent"))
                .map_err(|e| prune_error(&workspace, e))?;
            std::os::unix::fs::symlink(&shared_workspace, &workspace_abs)
                .map_err(|e| prune_error(&workspace, e))?;
            std::os::unix::fs::symlink(&shared_audit, &audit_path).map_err(|e| prune_error(&workspace, e))?;

            let mut state = self.state.borrow_mut();
            state.set_input_hashes(
                &workspace,
                InputState::Shared {
                    build_id,
                    location: shared_path.display().to_string(),
                },
            );
            state.set_storage_path(&workspace, &shared_workspace.display().to_string());
        }

        Ok(())
    }
}

fn prune_error(workspace: &str, e: std::io::Error) -> CookError {
    CookError::Build(BuildError::new(format!("cannot prune {workspace}")).with_source(e))
}
