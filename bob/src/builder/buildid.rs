// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build-id computation.
//!
//! Checkout steps resolve to their workspace tree hash, either by
//! actually checking out or through the live-build-id fast path. Build-
//! and package-steps derive their build-id recursively from their
//! inputs. Results are cached per workspace; concurrent requests for
//! the same step share one task.

use std::rc::Rc;

use log::{info, warn};

use crate::digest::{self, Digest, Encoder};
use crate::graph::{StepId, StepKind};
use crate::scm::{self, ScmContext};

use super::{BuildError, Completion, Cook, CookError, CookResult};

/// Cache key prefixes in the persistent build-id store.
const KEY_LIVE_QUERY: u8 = 0x00;
const KEY_LIVE_TRANSLATION: u8 = 0x01;

impl Cook {
    /// Build-id of one step, deduplicated and cached.
    pub(crate) async fn get_build_id(self: &Rc<Self>, step: StepId, depth: usize) -> CookResult<Digest> {
        let [build_id] = &self.get_build_ids(&[step], depth).await?[..] else {
            unreachable!("one result per step");
        };
        Ok(*build_id)
    }

    pub(crate) async fn get_build_ids(self: &Rc<Self>, steps: &[StepId], depth: usize) -> CookResult<Vec<Digest>> {
        let completions: Vec<Completion<Digest>> = steps
            .iter()
            .map(|&step| self.spawn_build_id_task(step, depth))
            .collect();

        let results = self
            .yield_job_while(futures_util::future::join_all(
                completions.iter().map(|c| c.wait()),
            ))
            .await?;

        results
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CookError::Cancel)
    }

    fn spawn_build_id_task(self: &Rc<Self>, step: StepId, depth: usize) -> Completion<Digest> {
        let key = self.task_key_build_id(step);
        if let Some(task) = self.build_id_tasks.borrow().get(&key) {
            return task.clone();
        }

        let completion = Completion::new();
        self.build_id_tasks.borrow_mut().insert(key.clone(), completion.clone());

        let this = self.clone();
        let task = completion.clone();
        let handle = tokio::task::spawn_local(async move {
            let result = async {
                this.acquire_runner().await?;
                let ret = this.build_id_single(step, depth).await;
                this.release_runner();
                ret
            }
            .await;

            match result {
                Ok(build_id) => {
                    this.build_id_tasks.borrow_mut().remove(&key);
                    task.complete(Ok(build_id));
                }
                Err(e) => {
                    this.record_failure(Some(step), e);
                    task.complete(Err(super::task::TaskFailed));
                }
            }
        });
        self.tasks.borrow_mut().push(handle);

        completion
    }

    fn task_key_build_id(&self, step: StepId) -> super::TaskKey {
        let sandbox = self
            .graph
            .step(step)
            .sandbox
            .as_ref()
            .map(|s| self.graph.variant_id(s.step));
        (self.workspace(step), sandbox, false)
    }

    async fn build_id_single(self: &Rc<Self>, step: StepId, depth: usize) -> CookResult<Digest> {
        let workspace = self.workspace(step);
        let data = self.graph.step(step);

        if data.kind == StepKind::Checkout {
            let key = (workspace, self.graph.variant_id(step));
            if let Some((build_id, _)) = self.src_build_ids.borrow().get(&key) {
                return Ok(*build_id);
            }
            let result = self.checkout_build_id(step, depth).await?;
            self.src_build_ids.borrow_mut().insert(key, result);
            return Ok(result.0);
        }

        if let Some(build_id) = self.dist_build_ids.borrow().get(&workspace) {
            return Ok(*build_id);
        }

        let fingerprint = self.get_fingerprint(step, depth).await?;

        let sandbox_build_id = match &self.graph.step(step).sandbox {
            Some(sandbox) => Some(self.get_build_id(sandbox.step, depth + 1).await?),
            None => None,
        };

        let deps: Vec<StepId> = self
            .graph
            .step(step)
            .deps
            .iter()
            .copied()
            .filter(|&d| self.graph.step(d).is_valid())
            .collect();
        let dep_build_ids = self.get_build_ids(&deps, depth + 1).await?;

        let build_id = digest::build_id(&self.graph, step, &fingerprint, sandbox_build_id, &dep_build_ids);
        self.dist_build_ids.borrow_mut().insert(workspace, build_id);
        Ok(build_id)
    }

    /// Build-id of a checkout step: predicted when possible, otherwise
    /// the hash of the real checkout. The boolean marks predictions.
    async fn checkout_build_id(self: &Rc<Self>, step: StepId, depth: usize) -> CookResult<(Digest, bool)> {
        let data = self.graph.step(step);
        let name = &self.graph.package_of(step).name;
        let workspace_exists = self.workspace_abs(step).exists();

        if !workspace_exists
            && !self.opts.always_checkout.iter().any(|re| re.is_match(name))
            && data.has_live_build_id()
            && self.archive.can_download()
        {
            if let Some(live_id) = self.query_live_build_id(step).await? {
                if let Some(build_id) = self.translate_live_build_id(live_id).await? {
                    info!("predicted sources of {name} ({build_id})");
                    return Ok((build_id, true));
                }
            }
            info!("live build-id of {name} unknown, checking out");
        }

        // No prediction: do the checkout and use the tree hash
        self.cook_steps(&[step], data.package, false, depth).await?;
        let workspace = self.workspace(step);
        let build_id = self
            .state
            .borrow()
            .result_hash(&workspace)
            .and_then(crate::state::ResultHash::digest)
            .ok_or_else(|| CookError::Build(BuildError::new(format!("checkout of {name} left no result"))))?;
        Ok((build_id, false))
    }

    /// Query the SCMs for their live-build-id, persistently cached
    /// under `\x00‖variant-id`. Build-only mode reuses the cache
    /// without asking again.
    async fn query_live_build_id(self: &Rc<Self>, step: StepId) -> CookResult<Option<Digest>> {
        let key = live_query_key(self.graph.variant_id(step));
        if self.opts.build_only {
            if let Some(live_id) = self.state.borrow().build_id(&key) {
                return Ok(Some(live_id));
            }
        }

        let ctx = self.scm_context(step);
        let mut enc = Encoder::new();
        for spec in &self.graph.step(step).scms {
            let scm = scm::from_spec(spec);
            match scm.predict_live_build_id(&ctx).await {
                Ok(Some(live_id)) => enc.put_digest(live_id),
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!("live build-id prediction failed: {e}");
                    return Ok(None);
                }
            }
        }
        let live_id = enc.finish();

        self.state.borrow_mut().set_build_id(&key, live_id);
        Ok(Some(live_id))
    }

    /// Combined live-build-id of a finished checkout.
    pub(crate) async fn calc_live_build_id(self: &Rc<Self>, step: StepId) -> CookResult<Option<Digest>> {
        let ctx = self.scm_context(step);
        let mut enc = Encoder::new();
        for spec in &self.graph.step(step).scms {
            let scm = scm::from_spec(spec);
            match scm.calc_live_build_id(&ctx).await {
                Ok(Some(live_id)) => enc.put_digest(live_id),
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!("live build-id calculation failed: {e}");
                    return Ok(None);
                }
            }
        }
        Ok(Some(enc.finish()))
    }

    /// Translate a live-build-id into a real build-id via the archive,
    /// cached under `\x01‖live-id`.
    async fn translate_live_build_id(self: &Rc<Self>, live_id: Digest) -> CookResult<Option<Digest>> {
        let key = live_translation_key(live_id);
        if let Some(build_id) = self.state.borrow().build_id(&key) {
            return Ok(Some(build_id));
        }

        let build_id = self
            .archive
            .download_live_build_id(live_id)
            .await
            .map_err(|e| CookError::Build(BuildError::new("archive failure").with_source(e)))?;

        if let Some(build_id) = build_id {
            self.state.borrow_mut().set_build_id(&key, build_id);
        }
        Ok(build_id)
    }

    /// A checkout produced different content than its prediction
    /// promised. Drop everything derived from the wrong build-id and
    /// restart the attempt.
    pub(crate) fn handle_changed_build_id(&self, step: StepId, checkout_hash: Digest) -> CookError {
        let workspace = self.workspace(step);
        let variant_id = self.graph.variant_id(step);

        // The cached live-build-id lied
        self.state.borrow_mut().del_build_id(&live_query_key(variant_id));

        self.src_build_ids
            .borrow_mut()
            .insert((workspace, variant_id), (checkout_hash, false));
        self.dist_build_ids.borrow_mut().clear();

        self.clear_was_run();
        self.clear_download_tried();

        CookError::Restart
    }

    pub(crate) fn scm_context(&self, step: StepId) -> ScmContext {
        ScmContext {
            workspace: self.workspace_abs(step),
            project_root: self.project.root.clone(),
        }
    }
}

fn live_query_key(variant_id: Digest) -> Vec<u8> {
    let mut key = vec![KEY_LIVE_QUERY];
    key.extend_from_slice(variant_id.as_bytes());
    key
}

fn live_translation_key(live_id: Digest) -> Vec<u8> {
    let mut key = vec![KEY_LIVE_TRANSLATION];
    key.extend_from_slice(live_id.as_bytes());
    key
}
