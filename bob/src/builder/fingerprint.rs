// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Host fingerprints.
//!
//! A fingerprint script probes the build host; its output taints the
//! build-id so artifacts from incompatible hosts never alias. Scripts
//! are executed once per unique key, concurrent requests share the
//! task. Results from sandboxed runs are reproducible and therefore
//! cached persistently and in the archive.

use std::rc::Rc;

use crate::digest::Digest;
use crate::graph::{StepId, StepKind};
use crate::invoker::{Invoker, StepSpec};

use super::{BuildError, Completion, Cook, CookError, CookResult};

impl Cook {
    /// The fingerprint entering a step's build-id. Empty for steps
    /// without host dependencies.
    pub(crate) async fn get_fingerprint(self: &Rc<Self>, step: StepId, depth: usize) -> CookResult<Vec<u8>> {
        let data = self.graph.step(step);
        let is_fingerprinted = data.fingerprint_script.is_some();
        // Relocation of non-relocatable packages is tracked like a host
        // property: the artifact is only valid at its exec path.
        let track_relocation = data.kind == StepKind::Package && !data.relocatable;

        if !is_fingerprinted && !track_relocation {
            return Ok(vec![]);
        }

        let mut fingerprint = if is_fingerprinted {
            let script = data.fingerprint_script.clone().expect("fingerprint script");
            let sandbox = data.sandbox.as_ref().map(|s| s.step);

            // Each sandbox gets its own fingerprint
            let mut key = Digest::of(&script);
            if let Some(sandbox) = sandbox {
                let sandbox_build_id = self.get_build_id(sandbox, depth + 1).await?;
                key = Digest::of_pair(key, sandbox_build_id);
            }

            match self.cached_fingerprint(key, sandbox.is_some()) {
                Some(fingerprint) => fingerprint,
                None => {
                    let task = self.spawn_fingerprint_task(step, script, sandbox, key, depth);
                    let result = self.yield_job_while(task.wait()).await?;
                    result.map_err(|_| CookError::Cancel)?
                }
            }
        } else {
            vec![]
        };

        if track_relocation {
            fingerprint.extend_from_slice(self.exec_path(step).as_bytes());
        }

        Ok(Digest::of(&fingerprint).as_bytes().to_vec())
    }

    fn cached_fingerprint(&self, key: Digest, sandboxed: bool) -> Option<Vec<u8>> {
        if let Some(fingerprint) = self.fingerprints.borrow().get(&key) {
            return Some(fingerprint.clone());
        }
        if sandboxed {
            return self.state.borrow().fingerprint(key);
        }
        None
    }

    fn spawn_fingerprint_task(
        self: &Rc<Self>,
        step: StepId,
        script: String,
        sandbox: Option<StepId>,
        key: Digest,
        depth: usize,
    ) -> Completion<Vec<u8>> {
        if let Some(task) = self.fingerprint_tasks.borrow().get(&key) {
            return task.clone();
        }

        let completion = Completion::new();
        self.fingerprint_tasks.borrow_mut().insert(key, completion.clone());

        let this = self.clone();
        let task = completion.clone();
        let handle = tokio::task::spawn_local(async move {
            let result = async {
                this.acquire_runner().await?;
                let ret = this.calc_fingerprint(step, &script, sandbox, key, depth).await;
                this.release_runner();
                ret
            }
            .await;

            match result {
                Ok(fingerprint) => task.complete(Ok(fingerprint)),
                Err(e) => {
                    this.record_failure(Some(step), e);
                    task.complete(Err(super::task::TaskFailed));
                }
            }
        });
        self.tasks.borrow_mut().push(handle);

        completion
    }

    async fn calc_fingerprint(
        self: &Rc<Self>,
        step: StepId,
        script: &str,
        sandbox: Option<StepId>,
        key: Digest,
        depth: usize,
    ) -> CookResult<Vec<u8>> {
        // Sandboxed fingerprints are host independent, the archive may
        // already know the answer.
        let mut fingerprint = match sandbox {
            Some(_) => self
                .archive
                .download_fingerprint(key)
                .await
                .map_err(|e| CookError::Build(BuildError::new("archive failure").with_source(e)))?,
            None => None,
        };

        if fingerprint.is_none() {
            if let Some(sandbox) = sandbox {
                // The sandbox content must exist to run inside it
                self.cook_steps(&[sandbox], self.graph.step(sandbox).package, false, depth + 1).await?;
            }

            let output = self.run_fingerprint_script(step, script).await?;

            if sandbox.is_some() {
                self.archive
                    .upload_fingerprint(key, &output)
                    .await
                    .map_err(|e| CookError::Build(BuildError::new("archive failure").with_source(e)))?;
            }
            fingerprint = Some(output);
        }

        let fingerprint = fingerprint.expect("fingerprint computed");
        self.fingerprints.borrow_mut().insert(key, fingerprint.clone());

        if sandbox.is_some() {
            self.state.borrow_mut().set_fingerprint(key, &fingerprint);
        }

        Ok(fingerprint)
    }

    async fn run_fingerprint_script(self: &Rc<Self>, step: StepId, script: &str) -> CookResult<Vec<u8>> {
        let spec = StepSpec {
            script: Some(script.to_owned()),
            ..self.step_spec(step, None)
        };

        let invoker = Invoker::new(spec);
        let (code, output) = invoker
            .execute_fingerprint()
            .await
            .map_err(|e| CookError::Build(BuildError::new("cannot run fingerprint script").with_source(e)))?;

        if code == -(nix::sys::signal::Signal::SIGINT as i32) {
            return Err(CookError::Build(
                BuildError::new("fingerprint script interrupted by user").resume_hint(),
            ));
        }
        if code != 0 {
            return Err(CookError::Build(BuildError::new(format!(
                "fingerprint script returned with {code}"
            ))));
        }

        Ok(output)
    }
}
