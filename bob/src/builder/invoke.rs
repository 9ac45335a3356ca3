// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Glue between the state machines and the invoker: freezing step
//! specs, writing the replay wrapper, linking dependency workspaces and
//! emitting audit records.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::rc::Rc;

use fs_err as fs;
use log::warn;

use crate::audit::Audit;
use crate::digest::Digest;
use crate::graph::{StepId, StepKind};
use crate::invoker::{DepMount, InvocationMode, Invoker, MakeParameters, SandboxSpec, StepSpec};
use crate::scm;
use crate::util;

use super::{BuildError, Cook, CookError, CookResult};

impl Cook {
    /// Freeze the invocation spec of a step.
    pub(crate) fn step_spec(&self, step: StepId, log_file: Option<PathBuf>) -> StepSpec {
        let data = self.graph.step(step);
        let sandboxed = data.sandbox.is_some();

        let mut paths = vec![];
        let mut libs = vec![];
        for tool in data.tools.values() {
            let root = self.result_exec_path(sandboxed, tool.step);
            paths.push(join_exec(&root, &tool.path));
            libs.extend(tool.libs.iter().map(|lib| join_exec(&root, lib)));
        }

        let sandbox = data.sandbox.as_ref().map(|sandbox| SandboxSpec {
            root: self.storage_abs(sandbox.step).display().to_string(),
            paths: sandbox.paths.clone(),
            mounts: sandbox.mounts.clone(),
            net_access: sandbox.net_access || data.net_access,
        });

        let dep_mounts = if sandboxed {
            data.all_dep_steps()
                .iter()
                .filter(|&&dep| self.graph.step(dep).is_valid())
                .map(|&dep| DepMount {
                    host: self.storage_abs(dep).display().to_string(),
                    guest: self.result_exec_path(true, dep),
                })
                .collect()
        } else {
            vec![]
        };

        let args = data
            .deps
            .iter()
            .filter(|&&dep| self.graph.step(dep).is_valid())
            .map(|&dep| self.result_exec_path(sandboxed, dep))
            .collect();

        StepSpec {
            workspace: self.workspace_abs(step).display().to_string(),
            exec_workspace: self.result_exec_path(sandboxed, step),
            project_root: self.project.root.display().to_string(),
            script: data.script.clone(),
            update_script: data.update_script.clone(),
            args,
            env: data.env.clone(),
            env_whitelist: self.project.config.whitelist(),
            paths,
            libs,
            scms: data.scms.clone(),
            sandbox,
            dep_mounts,
            log_file: log_file.map(|p| p.display().to_string()),
            clean: None,
            job_server: data.job_server,
        }
    }

    /// Where a consumer finds the result of `step` during execution.
    pub(crate) fn result_exec_path(&self, consumer_sandboxed: bool, step: StepId) -> String {
        if consumer_sandboxed {
            format!("/bob/{}", self.workspace(step))
        } else {
            self.storage_abs(step).display().to_string()
        }
    }

    /// Run the step script, with all the ceremony around it: spec file,
    /// replay wrapper, dependency links, log capture.
    pub(crate) async fn run_step(
        self: &Rc<Self>,
        step: StepId,
        mode: InvocationMode,
        workspace_created: bool,
        clean_workspace: bool,
    ) -> CookResult<()> {
        let workspace = self.workspace_abs(step);
        util::ensure_dir_exists(&workspace).map_err(|e| workspace_error(&workspace, e))?;
        let step_dir = workspace.parent().expect("workspace has a parent").to_path_buf();

        self.link_dependencies(step);

        // Materialize spec and wrapper for later replay
        let spec = self.step_spec(step, Some(step_dir.join("log.txt")));
        let spec_path = step_dir.join("step.spec");
        spec.save(&spec_path)
            .map_err(|e| CookError::Build(BuildError::new("cannot write step spec").with_source(e)))?;

        if let Some(script) = &self.graph.step(step).script {
            let _ = fs::write(step_dir.join("script"), script);
        }
        self.write_run_file(&step_dir, &spec_path, clean_workspace);

        let mut invoker = Invoker::new(spec);
        if self.graph.step(step).job_server {
            if let Some(fds) = self.runners.borrow().fds() {
                invoker.make_parameters(MakeParameters {
                    fds,
                    jobs: self.opts.jobs,
                });
            }
        }

        let code = invoker
            .execute_step(mode, workspace_created, clean_workspace)
            .await
            .map_err(|e| CookError::Build(BuildError::new("step execution failed").with_source(e)))?;

        if code == -(nix::sys::signal::Signal::SIGINT as i32) {
            return Err(CookError::Build(
                BuildError::new(format!("user aborted while running {}", self.workspace(step))).resume_hint(),
            ));
        }
        if code != 0 {
            return Err(CookError::Build(
                BuildError::new(format!("{} returned with {code}", self.workspace(step))).resume_hint(),
            ));
        }

        Ok(())
    }

    /// `run.sh` replays the step outside the scheduler.
    fn write_run_file(&self, step_dir: &std::path::Path, spec_path: &std::path::Path, clean: bool) {
        let run_file = step_dir.join("run.sh");
        let content = format!(
            "#!/bin/sh\ncd '{}'\nexec bob invoke {}'{}' \"$@\"\n",
            self.project.root.display(),
            if clean { "-c " } else { "" },
            spec_path.display(),
        );
        if fs::write(&run_file, content).is_ok() {
            let _ = fs::set_permissions(&run_file, std::fs::Permissions::from_mode(0o755));
        }
    }

    /// Symlink dependency workspaces next to the step workspace so
    /// users can navigate the inputs.
    fn link_dependencies(&self, step: StepId) {
        if !self.opts.link_deps {
            return;
        }
        let data = self.graph.step(step);
        let deps_dir = self.project.path(self.workspace(step)).parent().expect("parent").join("deps");
        if util::remove_path(&deps_dir).is_err() {
            return;
        }

        let mut links: Vec<(PathBuf, PathBuf)> = vec![];
        if let Some(sandbox) = &data.sandbox {
            links.push((deps_dir.join("sandbox"), self.storage_abs(sandbox.step)));
        }
        for (name, tool) in &data.tools {
            links.push((deps_dir.join("tools").join(name), self.storage_abs(tool.step)));
        }
        for (i, &dep) in data.deps.iter().enumerate() {
            if !self.graph.step(dep).is_valid() {
                continue;
            }
            let name = format!("{:02}-{}", i + 1, self.graph.package_of(dep).name);
            links.push((deps_dir.join("args").join(name), self.storage_abs(dep)));
        }

        for (link, target) in links {
            let Some(parent) = link.parent() else { continue };
            if util::ensure_dir_exists(parent).is_err() {
                continue;
            }
            let _ = std::os::unix::fs::symlink(&target, &link);
        }
    }

    /// Write the audit record of a finished step. Failure to audit is
    /// not fatal, it only degrades the artifact.
    pub(crate) async fn generate_audit(
        self: &Rc<Self>,
        step: StepId,
        result_hash: Digest,
        build_id: Digest,
        executed: bool,
    ) -> CookResult<Option<PathBuf>> {
        let workspace = self.workspace(step);
        let audit_path = self.project.audit_path(&workspace);
        util::remove_path(&audit_path).map_err(|e| workspace_error(&audit_path, e))?;
        if !self.opts.audit {
            return Ok(None);
        }

        let data = self.graph.step(step);
        let package = self.graph.package_of(step);

        let mut audit = Audit::create(self.graph.variant_id(step), build_id, result_hash);
        for (key, value) in &self.opts.audit_meta {
            audit.add_define(key.clone(), value.clone());
        }
        audit.add_define("bob", env!("CARGO_PKG_VERSION"));
        audit.add_define("recipe", package.name.clone());
        audit.add_define("package", package.stack.join("/"));
        audit.add_define("step", data.kind.tag());
        audit.add_define("language", "bash");
        audit.set_env(data.env.clone());

        if executed {
            let mut record_inputs = || -> Result<(), crate::audit::Error> {
                for (name, tool) in &data.tools {
                    audit.add_tool(name.as_str(), &self.project.audit_path(&self.workspace(tool.step)))?;
                }
                if let Some(sandbox) = &data.sandbox {
                    audit.add_dependency(&self.project.audit_path(&self.workspace(sandbox.step)))?;
                }
                for &dep in &data.deps {
                    if self.graph.step(dep).is_valid() {
                        audit.add_dependency(&self.project.audit_path(&self.workspace(dep)))?;
                    }
                }
                Ok(())
            };
            if let Err(e) = record_inputs() {
                warn!("audit of {workspace} failed: {e}");
                return Ok(None);
            }
        }

        if data.kind == StepKind::Checkout {
            let ctx = self.scm_context(step);
            for spec in &data.scms {
                let scm = scm::from_spec(spec);
                audit.add_scm(scm::audit(scm.as_ref(), &ctx).await);
            }
        }

        audit
            .save(&audit_path)
            .map_err(|e| CookError::Build(BuildError::new("cannot write audit record").with_source(e)))?;

        Ok(Some(audit_path))
    }
}

fn join_exec(root: &str, rel: &str) -> String {
    if rel.is_empty() || rel == "." {
        root.to_owned()
    } else {
        format!("{root}/{rel}")
    }
}

fn workspace_error(path: &std::path::Path, e: std::io::Error) -> CookError {
    CookError::Build(BuildError::new(format!("cannot prepare {}", path.display())).with_source(e))
}
