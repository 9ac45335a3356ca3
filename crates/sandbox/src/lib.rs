// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Lightweight Linux namespace sandbox for build steps.
//!
//! The step workspace is bind-mounted read-write at a stable guest path
//! while dependencies are mounted read-only. Everything runs in fresh
//! mount/pid/ipc/uts (and optionally net/user) namespaces on top of the
//! configured root filesystem.

use std::env::set_current_dir;
use std::fs::{copy, create_dir_all, remove_dir, write};
use std::io;
use std::os::fd::IntoRawFd;
use std::path::{Path, PathBuf};

use nix::libc::SIGCHLD;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{clone, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, getgid, getuid, pipe, pivot_root, read, sethostname, Uid};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    ReadOnly,
    ReadWrite,
}

/// A host directory mapped into the sandbox.
#[derive(Debug, Clone)]
pub struct Bind {
    pub source: PathBuf,
    pub target: PathBuf,
    pub mode: BindMode,
}

pub struct Sandbox {
    root: PathBuf,
    work_dir: Option<PathBuf>,
    binds: Vec<Bind>,
    networking: bool,
    hostname: Option<String>,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            work_dir: None,
            binds: vec![],
            networking: false,
            hostname: None,
        }
    }

    pub fn work_dir(self, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: Some(work_dir.into()),
            ..self
        }
    }

    pub fn bind_rw(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.binds.push(Bind {
            source: source.into(),
            target: target.into(),
            mode: BindMode::ReadWrite,
        });
        self
    }

    pub fn bind_ro(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.binds.push(Bind {
            source: source.into(),
            target: target.into(),
            mode: BindMode::ReadOnly,
        });
        self
    }

    pub fn networking(self, enabled: bool) -> Self {
        Self {
            networking: enabled,
            ..self
        }
    }

    pub fn hostname(self, hostname: impl ToString) -> Self {
        Self {
            hostname: Some(hostname.to_string()),
            ..self
        }
    }

    /// Clone into the namespaces and run `f` inside the sandbox.
    ///
    /// Returns the exit code reported by the child process.
    pub fn run(self, mut f: impl FnMut() -> i32) -> Result<i32, Error> {
        static mut STACK: [u8; 4 * 1024 * 1024] = [0u8; 4 * 1024 * 1024];

        let rootless = !Uid::effective().is_root();

        // Pipe to synchronize parent & child
        let sync = pipe().map_err(Error::Sync)?;

        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS;

        if rootless {
            flags |= CloneFlags::CLONE_NEWUSER;
        }

        if !self.networking {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        let sync_read = sync.0.into_raw_fd();
        let sync_write = sync.1.into_raw_fd();

        let pid = unsafe {
            clone(
                Box::new(|| match enter(&self, (sync_read, sync_write), &mut f) {
                    Ok(code) => code as isize,
                    Err(e) => {
                        eprintln!("sandbox: {e}");
                        127
                    }
                }),
                &mut STACK,
                flags,
                Some(SIGCHLD),
            )
            .map_err(Error::Clone)?
        };

        if rootless {
            // Map current user to root inside the sandbox
            write(format!("/proc/{pid}/setgroups"), "deny").map_err(Error::IdMap)?;
            write(format!("/proc/{pid}/uid_map"), format!("0 {} 1", getuid())).map_err(Error::IdMap)?;
            write(format!("/proc/{pid}/gid_map"), format!("0 {} 1", getgid())).map_err(Error::IdMap)?;
        }

        // Allow child to continue
        close(sync_write).map_err(Error::Sync)?;

        match waitpid(pid, None).map_err(Error::Wait)? {
            WaitStatus::Exited(_, code) => Ok(code),
            WaitStatus::Signaled(_, signal, _) => Ok(128 + signal as i32),
            _ => Ok(127),
        }
    }
}

fn enter(sandbox: &Sandbox, sync: (i32, i32), f: &mut impl FnMut() -> i32) -> Result<i32, Error> {
    // Close unused write end
    close(sync.1).map_err(Error::Sync)?;
    // Got EOF, id maps are in place
    read(sync.0, &mut [0u8; 1]).map_err(Error::Sync)?;
    close(sync.0).map_err(Error::Sync)?;

    setup(sandbox)?;

    Ok(f())
}

fn setup(sandbox: &Sandbox) -> Result<(), Error> {
    if sandbox.networking {
        setup_networking(&sandbox.root)?;
    }

    pivot(&sandbox.root, &sandbox.binds)?;

    setup_root_user()?;

    if let Some(hostname) = &sandbox.hostname {
        sethostname(hostname).map_err(Error::Hostname)?;
    }

    if let Some(dir) = &sandbox.work_dir {
        set_current_dir(dir).map_err(Error::Io)?;
    }

    Ok(())
}

fn pivot(root: &Path, binds: &[Bind]) -> Result<(), Error> {
    const OLD_PATH: &str = "old_root";

    let old_root = root.join(OLD_PATH);

    add_mount(None::<&Path>, "/", None, MsFlags::MS_REC | MsFlags::MS_PRIVATE)?;
    add_mount(Some(root), root, None, MsFlags::MS_BIND)?;

    for bind in binds {
        let source = bind.source.canonicalize().map_err(Error::Io)?;
        let target = root.join(bind.target.strip_prefix("/").unwrap_or(&bind.target));
        add_mount(Some(&source), &target, None, MsFlags::MS_BIND)?;
        if bind.mode == BindMode::ReadOnly {
            // Bind mounts only honor read-only on remount
            add_mount(
                Some(&source),
                &target,
                None,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            )?;
        }
    }

    ensure_directory(&old_root)?;
    pivot_root(root, &old_root).map_err(Error::Pivot)?;

    set_current_dir("/").map_err(Error::Io)?;

    add_mount(Some("proc"), "proc", Some("proc"), MsFlags::empty())?;
    add_mount(Some("tmpfs"), "tmp", Some("tmpfs"), MsFlags::empty())?;
    add_mount(
        Some(format!("/{OLD_PATH}/sys").as_str()),
        "sys",
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE,
    )?;
    add_mount(
        Some(format!("/{OLD_PATH}/dev").as_str()),
        "dev",
        None,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_SLAVE,
    )?;

    umount2(OLD_PATH, MntFlags::MNT_DETACH).map_err(Error::Mount)?;
    remove_dir(OLD_PATH).map_err(Error::Io)?;

    Ok(())
}

fn setup_root_user() -> Result<(), Error> {
    ensure_directory("/etc")?;
    write("/etc/passwd", "root:x:0:0:root::/bin/sh").map_err(Error::Io)?;
    write("/etc/group", "root:x:0:").map_err(Error::Io)?;
    Ok(())
}

fn setup_networking(root: &Path) -> Result<(), Error> {
    ensure_directory(root.join("etc"))?;
    copy("/etc/resolv.conf", root.join("etc/resolv.conf")).map_err(Error::Io)?;
    Ok(())
}

fn ensure_directory(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    if !path.exists() {
        create_dir_all(path).map_err(Error::Io)?;
    }
    Ok(())
}

fn add_mount<T: AsRef<Path>>(source: Option<T>, target: impl AsRef<Path>, fs_type: Option<&str>, flags: MsFlags) -> Result<(), Error> {
    ensure_directory(&target)?;
    mount(
        source.as_ref().map(AsRef::as_ref),
        target.as_ref(),
        fs_type,
        flags,
        Option::<&str>::None,
    )
    .map_err(Error::Mount)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("synchronize with sandbox child")]
    Sync(#[source] nix::Error),
    #[error("clone sandbox process")]
    Clone(#[source] nix::Error),
    #[error("write sandbox id maps")]
    IdMap(#[source] io::Error),
    #[error("mount")]
    Mount(#[source] nix::Error),
    #[error("pivot root")]
    Pivot(#[source] nix::Error),
    #[error("set hostname")]
    Hostname(#[source] nix::Error),
    #[error("wait for sandbox child")]
    Wait(#[source] nix::Error),
    #[error("io")]
    Io(#[source] io::Error),
}
