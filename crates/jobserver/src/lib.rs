// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! GNU-make compatible job-server token pool.
//!
//! Parallelism is coordinated through a pipe holding one byte per job
//! slot. Cooperating processes read a token before doing work and write
//! it back when done. We either own the pipe ourselves or join the pipe
//! of an outer `make` invocation.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::{pipe, read, write};
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub mod makeflags;

/// Token value used to charge an internally created pipe.
const TOKEN: u8 = b'+';

/// The pipe ends of a job server, suitable for passing to children.
#[derive(Debug, Clone, Copy)]
pub struct Fds {
    pub read: RawFd,
    pub write: RawFd,
}

/// A pool of job permits.
///
/// With a single job, or where pipes are unavailable, this degrades to a
/// plain counting semaphore. Otherwise permits are bytes flowing through
/// a job-server pipe.
pub enum Permits {
    Counting(tokio::sync::Semaphore),
    Pipe(PipePermits),
}

impl Permits {
    /// Simple in-process counting semaphore with `jobs` permits.
    pub fn counting(jobs: usize) -> Self {
        Permits::Counting(tokio::sync::Semaphore::new(jobs))
    }

    /// Create a fresh job-server pipe charged with `jobs` tokens.
    ///
    /// We own the pipe, so one token is pre-charged for ourselves and
    /// the first acquisition does not consume a byte (recursive mode).
    pub fn owned(jobs: usize) -> Result<Self, Error> {
        let (rfd, wfd) = pipe().map_err(Error::CreatePipe)?;
        // One implicit token for us, the rest in the pipe.
        let charge = vec![TOKEN; jobs.saturating_sub(1)];
        write(wfd, &charge).map_err(Error::Charge)?;
        let rfd = unsafe { OwnedFd::from_raw_fd(rfd) };
        let wfd = unsafe { OwnedFd::from_raw_fd(wfd) };
        PipePermits::new(rfd, wfd, true).map(Permits::Pipe)
    }

    /// Join the job-server pipe of an outer make via inherited fds.
    ///
    /// Every permit is a real token read from the pipe; nothing is
    /// pre-charged for us (non-recursive mode).
    ///
    /// # Safety
    ///
    /// Both fds must be open pipe ends owned by the caller and must not
    /// be used elsewhere afterwards.
    pub unsafe fn external(read: RawFd, write: RawFd) -> Result<Self, Error> {
        let rfd = OwnedFd::from_raw_fd(read);
        let wfd = OwnedFd::from_raw_fd(write);
        PipePermits::new(rfd, wfd, false).map(Permits::Pipe)
    }

    /// Take one permit, waiting for a free slot.
    ///
    /// Pending acquisitions are satisfied in request order. Dropping the
    /// returned future before completion gives the slot back.
    pub async fn acquire(&self) -> Result<(), Error> {
        match self {
            Permits::Counting(sem) => {
                let permit = sem.acquire().await.map_err(|_| Error::Closed)?;
                permit.forget();
                Ok(())
            }
            Permits::Pipe(pipe) => pipe.acquire().await,
        }
    }

    /// Give a previously acquired permit back.
    pub fn release(&self) {
        match self {
            Permits::Counting(sem) => sem.add_permits(1),
            Permits::Pipe(pipe) => pipe.release(),
        }
    }

    /// Pipe fds to forward into job-server aware children, if any.
    pub fn fds(&self) -> Option<Fds> {
        match self {
            Permits::Counting(_) => None,
            Permits::Pipe(pipe) => Some(Fds {
                read: pipe.reader.as_raw_fd(),
                write: pipe.writer.as_raw_fd(),
            }),
        }
    }
}

/// Job permits backed by a job-server pipe.
pub struct PipePermits {
    reader: OwnedFd,
    writer: OwnedFd,
    recursive: bool,
    state: Mutex<State>,
    requests: mpsc::UnboundedSender<oneshot::Sender<u8>>,
    pump: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    /// Permits currently held by this process.
    acquired: usize,
    /// Token bytes backing the held permits. May be shorter than
    /// `acquired` by one in recursive mode (the implicit token).
    tokens: Vec<u8>,
    /// The implicit token was turned into a pipe byte on release. From
    /// then on every permit is a real token.
    converted: bool,
}

impl PipePermits {
    fn new(rfd: OwnedFd, wfd: OwnedFd, recursive: bool) -> Result<Self, Error> {
        set_nonblocking(rfd.as_raw_fd())?;

        let pump_reader = AsyncFd::new(rfd.try_clone().map_err(Error::Register)?).map_err(Error::Register)?;
        let pump_writer = wfd.try_clone().map_err(Error::Register)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump(pump_reader, pump_writer, rx));

        Ok(Self {
            reader: rfd,
            writer: wfd,
            recursive,
            state: Mutex::new(State::default()),
            requests: tx,
            pump,
        })
    }

    async fn acquire(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().expect("mutex lock");
            if self.recursive && !state.converted && state.acquired == 0 {
                state.acquired = 1;
                return Ok(());
            }
        }

        let (reply, token) = oneshot::channel();
        self.requests.send(reply).map_err(|_| Error::Closed)?;
        let byte = token.await.map_err(|_| Error::Closed)?;

        let mut state = self.state.lock().expect("mutex lock");
        state.acquired += 1;
        state.tokens.push(byte);
        Ok(())
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("mutex lock");
        assert!(state.acquired > 0, "permit released but none acquired");

        // Returned permits always become pipe bytes so that parked
        // waiters are woken through the pump. The implicit token of
        // recursive mode is materialized on its first release.
        let byte = match state.tokens.pop() {
            Some(byte) => byte,
            None => {
                state.converted = true;
                TOKEN
            }
        };
        if let Err(e) = write(self.writer.as_raw_fd(), &[byte]) {
            log::warn!("failed to return job token: {e}");
        }
        state.acquired -= 1;
    }
}

impl Drop for PipePermits {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Serve queued acquisitions one token at a time.
///
/// Runs only while requests are pending, so tokens stay in the pipe for
/// sibling processes whenever we are idle. A token read for a waiter
/// that has given up meanwhile is written straight back.
async fn pump(
    reader: AsyncFd<OwnedFd>,
    writer: OwnedFd,
    mut requests: mpsc::UnboundedReceiver<oneshot::Sender<u8>>,
) {
    while let Some(reply) = requests.recv().await {
        let byte = loop {
            let Ok(mut guard) = reader.readable().await else {
                return;
            };
            let mut buf = [0u8; 1];
            match read(reader.get_ref().as_raw_fd(), &mut buf) {
                Ok(1) => break buf[0],
                Ok(_) => return,
                Err(nix::errno::Errno::EAGAIN) => {
                    guard.clear_ready();
                }
                Err(e) => {
                    log::warn!("job server pipe broken: {e}");
                    return;
                }
            }
        };

        if reply.send(byte).is_err() {
            let _ = write(writer.as_raw_fd(), &[byte]);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), Error> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(Error::Fcntl)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(Error::Fcntl)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("create job server pipe")]
    CreatePipe(#[source] nix::Error),
    #[error("charge job server pipe")]
    Charge(#[source] nix::Error),
    #[error("register job server pipe")]
    Register(#[source] std::io::Error),
    #[error("configure job server pipe")]
    Fcntl(#[source] nix::Error),
    #[error("job server closed")]
    Closed,
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn run_bounded(permits: Permits, tasks: usize, limit: usize) {
        let permits = Arc::new(permits);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..tasks)
            .map(|_| {
                let permits = permits.clone();
                let running = running.clone();
                let peak = peak.clone();
                tokio::spawn(async move {
                    permits.acquire().await.unwrap();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    permits.release();
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= limit);
    }

    #[tokio::test]
    async fn counting_bounds_concurrency() {
        run_bounded(Permits::counting(2), 8, 2).await;
    }

    #[tokio::test]
    async fn owned_pipe_bounds_concurrency() {
        run_bounded(Permits::owned(3).unwrap(), 12, 3).await;
    }

    #[tokio::test]
    async fn single_job_pipe_serializes() {
        run_bounded(Permits::owned(1).unwrap(), 5, 1).await;
    }

    #[tokio::test]
    async fn all_waiters_eventually_acquire() {
        let permits = Arc::new(Permits::owned(2).unwrap());
        let done = Arc::new(AtomicUsize::new(0));

        let tasks = (0..6)
            .map(|_| {
                let permits = permits.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    permits.acquire().await.unwrap();
                    tokio::task::yield_now().await;
                    permits.release();
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(done.load(Ordering::SeqCst), 6);
    }
}
