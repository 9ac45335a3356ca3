// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Step execution.
//!
//! A [`StepSpec`] is a frozen snapshot of everything needed to run one
//! step: environment, paths, mounts, scripts. The builder writes it next
//! to the workspace (`step.spec`) so a step can be replayed later with
//! `bob invoke`. The [`Invoker`] interprets a spec: it materializes the
//! script in a scratch directory, optionally wraps the command in the
//! namespace sandbox and captures all output into the step log.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::Local;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::graph::HostMount;
use crate::scm::{self, ScmContext, ScmSpec};

/// How a step is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationMode {
    /// Regular run: SCMs, then the step script.
    Call,
    /// Build-only source update: local SCMs and the update script.
    Update,
    /// Interactive shell in the step environment.
    Shell,
}

/// Sandbox description inside a [`StepSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSpec {
    /// Host path of the sandbox root filesystem.
    pub root: String,
    /// `$PATH` entries valid inside the sandbox.
    pub paths: Vec<String>,
    pub mounts: Vec<HostMount>,
    pub net_access: bool,
}

/// Read-only mount of a dependency workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepMount {
    pub host: String,
    pub guest: String,
}

/// Frozen snapshot of one step invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSpec {
    /// Absolute workspace path on the host.
    pub workspace: String,
    /// Workspace path as the script sees it (stable `/bob/…` path
    /// under a sandbox).
    pub exec_workspace: String,
    pub project_root: String,
    pub script: Option<String>,
    pub update_script: Option<String>,
    /// Result paths of the consumed dependencies, passed to the script
    /// as positional arguments.
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub env_whitelist: Vec<String>,
    /// `$PATH` entries contributed by tools.
    pub paths: Vec<String>,
    /// Library search paths contributed by tools.
    pub libs: Vec<String>,
    pub scms: Vec<ScmSpec>,
    pub sandbox: Option<SandboxSpec>,
    pub dep_mounts: Vec<DepMount>,
    pub log_file: Option<String>,
    /// Clean the workspace before running, overriding the caller.
    pub clean: Option<bool>,
    pub job_server: bool,
}

impl StepSpec {
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let data = serde_json::to_vec_pretty(self).map_err(|e| Error::Spec(e.to_string()))?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let data = fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| Error::Spec(e.to_string()))
    }
}

/// Job-server parameters forwarded to make-aware scripts.
#[derive(Debug, Clone, Copy)]
pub struct MakeParameters {
    pub fds: jobserver::Fds,
    pub jobs: usize,
}

pub struct Invoker {
    spec: StepSpec,
    make: Option<MakeParameters>,
}

impl Invoker {
    pub fn new(spec: StepSpec) -> Self {
        Self { spec, make: None }
    }

    pub fn make_parameters(&mut self, make: MakeParameters) {
        self.make = Some(make);
    }

    /// Execute the step. Returns the exit code; death by signal is
    /// reported as the negated signal number.
    pub async fn execute_step(&self, mode: InvocationMode, workspace_created: bool, clean: bool) -> Result<i32, Error> {
        let mut log = Log::open(self.spec.log_file.as_deref())?;

        let result = self.execute_inner(mode, workspace_created, clean, &mut log).await;

        let code = match &result {
            Ok(code) => *code,
            Err(_) => 1,
        };
        log.close(code)?;

        result
    }

    async fn execute_inner(
        &self,
        mode: InvocationMode,
        workspace_created: bool,
        clean: bool,
        log: &mut Log,
    ) -> Result<i32, Error> {
        let workspace = Path::new(&self.spec.workspace);

        // Scratch directory for the script file; removed on all paths.
        let tmp = tempfile::tempdir()?;

        // Prepare workspace
        let clean = self.spec.clean.unwrap_or(clean);
        if !workspace.is_dir() {
            fs::create_dir_all(workspace)?;
        } else if clean && mode != InvocationMode::Shell {
            crate::util::empty_directory(workspace)?;
        }

        // SCM phase
        if mode != InvocationMode::Shell {
            let ctx = ScmContext {
                workspace: workspace.to_path_buf(),
                project_root: PathBuf::from(&self.spec.project_root),
            };
            for spec in &self.spec.scms {
                let scm = scm::from_spec(spec);
                if mode == InvocationMode::Update && !scm.is_local() {
                    continue;
                }
                scm.invoke(&ctx, workspace_created).await.map_err(|e| {
                    log.line(&format!("SCM {} failed: {e}", spec.directory()));
                    Error::Scm(e)
                })?;
            }
        }

        // Script phase
        let script = match mode {
            InvocationMode::Call | InvocationMode::Shell => self.spec.script.as_deref(),
            InvocationMode::Update => self.spec.update_script.as_deref(),
        };

        match (mode, script) {
            (InvocationMode::Shell, _) => self.run_shell().await,
            (_, None) => Ok(0),
            (_, Some(script)) => {
                let script_file = tmp.path().join("script");
                fs::write(&script_file, script)?;
                self.run_script(&script_file, tmp.path(), log).await
            }
        }
    }

    /// Execute the host probe script, capturing its output.
    pub async fn execute_fingerprint(&self) -> Result<(i32, Vec<u8>), Error> {
        let Some(script) = self.spec.script.as_deref() else {
            return Ok((0, vec![]));
        };

        let tmp = tempfile::tempdir()?;
        let script_file = tmp.path().join("fingerprint");
        fs::write(&script_file, script)?;

        let output = tokio::process::Command::new("/bin/bash")
            .arg("-e")
            .arg(&script_file)
            .env_clear()
            .envs(self.environment())
            .current_dir(tmp.path())
            .output()
            .await?;

        Ok((exit_code(&output.status), output.stdout))
    }

    /// Run an in-place SCM switch.
    pub async fn execute_scm_switch(&self, spec: &ScmSpec, old: &ScmSpec) -> Result<i32, Error> {
        let mut log = Log::open(self.spec.log_file.as_deref())?;
        let ctx = ScmContext {
            workspace: PathBuf::from(&self.spec.workspace),
            project_root: PathBuf::from(&self.spec.project_root),
        };

        let result = match scm::from_spec(spec).switch(&ctx, old).await {
            Ok(()) => Ok(0),
            Err(scm::Error::SwitchUnsupported) => Ok(1),
            Err(e) => {
                log.line(&format!("SCM switch failed: {e}"));
                Err(Error::Scm(e))
            }
        };

        let code = match &result {
            Ok(code) => *code,
            Err(_) => 1,
        };
        log.close(code)?;
        result
    }

    /// The resolved environment of the step: whitelisted host values,
    /// the frozen step environment, search paths and job-server
    /// plumbing.
    fn environment(&self) -> BTreeMap<String, String> {
        let mut env: BTreeMap<String, String> = std::env::vars()
            .filter(|(key, _)| self.spec.env_whitelist.iter().any(|allowed| allowed == key))
            .collect();
        env.extend(self.spec.env.clone());

        let mut paths = self.spec.paths.clone();
        match &self.spec.sandbox {
            Some(sandbox) => paths.extend(sandbox.paths.iter().cloned()),
            None => {
                if let Ok(host_path) = std::env::var("PATH") {
                    paths.push(host_path);
                }
            }
        }
        if !paths.is_empty() {
            env.insert("PATH".into(), paths.join(":"));
        }

        if !self.spec.libs.is_empty() {
            env.insert("LD_LIBRARY_PATH".into(), self.spec.libs.join(":"));
        }

        if self.spec.job_server {
            if let Some(make) = &self.make {
                let flags = jobserver::makeflags::compose(
                    env.get("MAKEFLAGS").map(String::as_str),
                    make.fds,
                    make.jobs,
                );
                env.insert("MAKEFLAGS".into(), flags);
            }
        }

        env
    }

    async fn run_script(&self, script_file: &Path, tmp: &Path, log: &mut Log) -> Result<i32, Error> {
        match &self.spec.sandbox {
            Some(sandbox) => self.run_sandboxed(script_file, tmp, sandbox, log).await,
            None => self.run_plain(script_file, log).await,
        }
    }

    async fn run_plain(&self, script_file: &Path, log: &mut Log) -> Result<i32, Error> {
        let mut child = tokio::process::Command::new("/bin/bash")
            .arg("-e")
            .arg(script_file)
            .args(&self.spec.args)
            .env_clear()
            .envs(self.environment())
            .current_dir(&self.spec.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = log.tee(child.stdout.take().expect("piped stdout"), false);
        let stderr = log.tee(child.stderr.take().expect("piped stderr"), true);

        let status = child.wait().await?;
        let _ = tokio::join!(stdout, stderr);

        Ok(exit_code(&status))
    }

    async fn run_sandboxed(
        &self,
        script_file: &Path,
        tmp: &Path,
        sandbox_spec: &SandboxSpec,
        log: &mut Log,
    ) -> Result<i32, Error> {
        log.line("entering sandbox");

        let mut sb = sandbox::Sandbox::new(&sandbox_spec.root)
            .hostname("bob")
            .networking(sandbox_spec.net_access)
            .work_dir(&self.spec.exec_workspace)
            // Workspace read-write at its stable path
            .bind_rw(&self.spec.workspace, &self.spec.exec_workspace)
            // Script scratch dir read-only
            .bind_ro(tmp, "/bob/.tmp");

        for mount in &sandbox_spec.mounts {
            if mount.optional && !Path::new(&mount.host).exists() {
                continue;
            }
            sb = if mount.writable {
                sb.bind_rw(&mount.host, &mount.guest)
            } else {
                sb.bind_ro(&mount.host, &mount.guest)
            };
        }

        // Dependencies read-only
        for dep in &self.spec.dep_mounts {
            sb = sb.bind_ro(&dep.host, &dep.guest);
        }

        let script_name = script_file.file_name().expect("script file name").to_owned();
        let args = self.spec.args.clone();
        let env = self.environment();
        let exec_workspace = self.spec.exec_workspace.clone();

        // The sandbox forks and blocks; keep it off the event loop.
        let code = tokio::task::spawn_blocking(move || {
            sb.run(move || {
                let script = Path::new("/bob/.tmp").join(&script_name);
                match std::process::Command::new("/bin/bash")
                    .arg("-e")
                    .arg(&script)
                    .args(&args)
                    .env_clear()
                    .envs(&env)
                    .current_dir(&exec_workspace)
                    .status()
                {
                    Ok(status) => exit_code(&status),
                    Err(e) => {
                        eprintln!("cannot run script: {e}");
                        127
                    }
                }
            })
        })
        .await
        .map_err(std::io::Error::other)?
        .map_err(Error::Sandbox)?;

        Ok(code)
    }

    async fn run_shell(&self) -> Result<i32, Error> {
        let status = tokio::process::Command::new("/bin/bash")
            .env_clear()
            .envs(self.environment())
            .current_dir(&self.spec.workspace)
            .status()
            .await?;
        Ok(exit_code(&status))
    }
}

fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(1),
    }
}

/// Append-only step log with start/end markers. All child output is
/// mirrored to the console and recorded here.
struct Log {
    file: Option<std::sync::Arc<std::sync::Mutex<fs::File>>>,
}

impl Log {
    fn open(path: Option<&str>) -> Result<Self, Error> {
        let file = match path {
            Some(path) => {
                let mut file = fs::OpenOptions::new().append(true).create(true).open(path)?;
                use std::io::Write as _;
                writeln!(file, "### START: {}", Local::now().format("%c"))?;
                Some(std::sync::Arc::new(std::sync::Mutex::new(file)))
            }
            None => None,
        };
        Ok(Self { file })
    }

    fn line(&mut self, text: &str) {
        if let Some(file) = &self.file {
            use std::io::Write as _;
            let _ = writeln!(file.lock().expect("log lock"), "{text}");
        }
    }

    fn close(&mut self, code: i32) -> Result<(), Error> {
        if let Some(file) = self.file.take() {
            use std::io::Write as _;
            writeln!(
                file.lock().expect("log lock"),
                "### END({code}): {}",
                Local::now().format("%c")
            )?;
        }
        Ok(())
    }

    /// Copy child output line-wise to the console and the log file.
    fn tee(&self, pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static, stderr: bool) -> tokio::task::JoinHandle<()> {
        let file = self.file.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(pipe).lines();
            let mut out = tokio::io::stdout();
            let mut err = tokio::io::stderr();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(file) = &file {
                    use std::io::Write as _;
                    let _ = writeln!(file.lock().expect("log lock"), "{line}");
                }
                let text = format!("{line}\n");
                let _ = if stderr {
                    err.write_all(text.as_bytes()).await
                } else {
                    out.write_all(text.as_bytes()).await
                };
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed step spec: {0}")]
    Spec(String),
    #[error("scm")]
    Scm(#[source] scm::Error),
    #[error("sandbox")]
    Sandbox(#[source] sandbox::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(workspace: &Path, script: &str) -> StepSpec {
        StepSpec {
            workspace: workspace.display().to_string(),
            exec_workspace: workspace.display().to_string(),
            project_root: workspace.parent().unwrap().display().to_string(),
            script: Some(script.to_owned()),
            update_script: None,
            args: vec![],
            env: BTreeMap::new(),
            env_whitelist: vec![],
            paths: vec![],
            libs: vec![],
            scms: vec![],
            sandbox: None,
            dep_mounts: vec![],
            log_file: None,
            clean: None,
            job_server: false,
        }
    }

    #[tokio::test]
    async fn runs_script_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");

        let invoker = Invoker::new(spec(&workspace, "echo ok > result.txt"));
        let code = invoker.execute_step(InvocationMode::Call, true, false).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(fs::read_to_string(workspace.join("result.txt")).unwrap(), "ok\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");

        let invoker = Invoker::new(spec(&workspace, "exit 7"));
        let code = invoker.execute_step(InvocationMode::Call, true, false).await.unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn env_is_restricted_to_spec_and_whitelist() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");

        let mut step = spec(&workspace, "echo \"${SECRET:-unset}:${VISIBLE:-unset}\" > env.txt");
        step.env.insert("VISIBLE".into(), "yes".into());

        std::env::set_var("SECRET", "leak");
        let invoker = Invoker::new(step);
        invoker.execute_step(InvocationMode::Call, true, false).await.unwrap();
        std::env::remove_var("SECRET");

        assert_eq!(
            fs::read_to_string(workspace.join("env.txt")).unwrap(),
            "unset:yes\n"
        );
    }

    #[tokio::test]
    async fn log_file_wraps_output_with_markers() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let log = dir.path().join("log.txt");

        let mut step = spec(&workspace, "echo hello");
        step.log_file = Some(log.display().to_string());

        let invoker = Invoker::new(step);
        invoker.execute_step(InvocationMode::Call, true, false).await.unwrap();

        let text = fs::read_to_string(&log).unwrap();
        assert!(text.contains("### START:"));
        assert!(text.contains("hello"));
        assert!(text.contains("### END(0):"));
    }

    #[tokio::test]
    async fn clean_empties_workspace_first() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        fs::create_dir_all(&workspace).unwrap();
        fs::write(workspace.join("stale.txt"), "old").unwrap();

        let invoker = Invoker::new(spec(&workspace, "ls > contents.txt"));
        invoker.execute_step(InvocationMode::Call, false, true).await.unwrap();

        assert!(!workspace.join("stale.txt").exists());
    }

    #[tokio::test]
    async fn update_mode_skips_main_script() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");

        let mut step = spec(&workspace, "echo main > ran.txt");
        step.update_script = Some("echo update > ran.txt".into());

        let invoker = Invoker::new(step);
        invoker.execute_step(InvocationMode::Update, false, false).await.unwrap();

        assert_eq!(fs::read_to_string(workspace.join("ran.txt")).unwrap(), "update\n");
    }

    #[tokio::test]
    async fn spec_roundtrips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("workspace");
        let path = dir.path().join("step.spec");

        let mut step = spec(&workspace, "true");
        step.env.insert("A".into(), "1".into());
        step.save(&path).unwrap();

        let back = StepSpec::load(&path).unwrap();
        assert_eq!(back.script.as_deref(), Some("true"));
        assert_eq!(back.env.get("A").unwrap(), "1");
    }
}
