// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Single-threaded completion cells for task deduplication.
//!
//! Many tasks may wait for one step to be cooked. The completion stores
//! the terminal outcome so that early and late waiters observe the same
//! result; the actual error is recorded once in the shared error list.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Marker for a failed task. The underlying error was already recorded.
#[derive(Debug, Clone, Copy)]
pub struct TaskFailed;

struct Inner<T> {
    result: Option<Result<T, TaskFailed>>,
    wakers: Vec<Waker>,
}

/// A one-shot, clonable completion cell.
pub struct Completion<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                result: None,
                wakers: vec![],
            })),
        }
    }

    /// Settle the completion, waking all waiters. May only be called
    /// once.
    pub fn complete(&self, result: Result<T, TaskFailed>) {
        let mut inner = self.inner.borrow_mut();
        debug_assert!(inner.result.is_none(), "completion settled twice");
        inner.result = Some(result);
        for waker in inner.wakers.drain(..) {
            waker.wake();
        }
    }

    /// Wait for the terminal outcome.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Wait<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: Clone> Future for Wait<T> {
    type Output = Result<T, TaskFailed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match &inner.result {
            Some(result) => Poll::Ready(result.clone()),
            None => {
                inner.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn waiters_before_and_after_completion() {
        let completion = Completion::<u32>::new();

        let early = completion.wait();
        completion.complete(Ok(7));
        assert_eq!(early.await.unwrap(), 7);

        let late = completion.wait();
        assert_eq!(late.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn failure_is_observed_by_all() {
        let completion = Completion::<()>::new();
        let w1 = completion.wait();
        let w2 = completion.wait();
        completion.complete(Err(TaskFailed));
        assert!(w1.await.is_err());
        assert!(w2.await.is_err());
    }

    #[tokio::test]
    async fn concurrent_waiter_is_woken() {
        let completion = Completion::<u32>::new();

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let waiter = {
                    let completion = completion.clone();
                    tokio::task::spawn_local(async move { completion.wait().await })
                };
                tokio::task::yield_now().await;
                completion.complete(Ok(3));
                assert_eq!(waiter.await.unwrap().unwrap(), 3);
            })
            .await;
    }
}
