//! Single-writer hand-off from worker threads
//!
//! Workers never mutate what a viewer is looking at directly. They post a
//! closure to a [`Dispatcher`] (the UI thread in a desktop shell, a dedicated
//! thread in the CLI) and, where ordering matters, wait on the returned
//! [`Completion`] before releasing the resources the closure depends on.

use crate::error::LoadError;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs posted jobs one at a time, in order, on its own context.
pub trait Dispatcher: Send + Sync {
    fn post(&self, job: Job) -> Result<(), LoadError>;
}

pub trait DispatcherExt: Dispatcher {
    /// Run `f` on the dispatcher and get its result back.
    fn invoke<R, F>(&self, f: F) -> Completion<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let posted = self.post(Box::new(move || {
            // receiver may have given up; nothing to do then
            let _ = tx.send(f());
        }));
        if let Err(e) = posted {
            // the dropped job closed the channel, so the completion reports it
            debug!(error = %e, "Dispatcher rejected job");
        }
        Completion { rx }
    }
}

impl<D: Dispatcher + ?Sized> DispatcherExt for D {}

/// Result of work running elsewhere. Wait on it from a plain thread or await
/// it from async code.
#[must_use = "a completion does nothing unless waited on"]
pub struct Completion<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> Completion<R> {
    /// An already finished completion.
    pub fn ready(value: R) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(value);
        Self { rx }
    }

    pub(crate) fn channel() -> (oneshot::Sender<R>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Block the calling thread until the work has run.
    ///
    /// Must not be called from inside an async runtime; `.await` it there.
    pub fn wait(self) -> Result<R, LoadError> {
        self.rx.blocking_recv().map_err(|_| LoadError::DispatcherClosed)
    }
}

impl<R> Future for Completion<R> {
    type Output = Result<R, LoadError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|result| result.map_err(|_| LoadError::DispatcherClosed))
    }
}

/// Runs every job immediately on the posting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn post(&self, job: Job) -> Result<(), LoadError> {
        job();
        Ok(())
    }
}

/// Posts jobs to a [`DispatchQueue`] drained by whoever owns it.
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: Sender<Job>,
}

impl QueueDispatcher {
    pub fn channel() -> (Self, DispatchQueue) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, DispatchQueue { rx })
    }
}

impl Dispatcher for QueueDispatcher {
    fn post(&self, job: Job) -> Result<(), LoadError> {
        self.tx.send(job).map_err(|_| LoadError::DispatcherClosed)
    }
}

/// The receiving end of a [`QueueDispatcher`].
pub struct DispatchQueue {
    rx: Receiver<Job>,
}

impl DispatchQueue {
    /// Run whatever is queued right now. Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            job();
            ran += 1;
        }
        ran
    }

    /// Run jobs as they arrive until `timeout` has passed.
    pub fn run_for(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut ran = 0;
        loop {
            match self.rx.recv_deadline(deadline) {
                Ok(job) => {
                    job();
                    ran += 1;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return ran,
            }
        }
    }

    /// Run jobs until every [`QueueDispatcher`] clone has been dropped.
    pub fn run(self) {
        for job in self.rx.iter() {
            job();
        }
    }

    /// Drain the queue on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("dispatch".to_string())
            .spawn(move || {
                self.run();
                debug!("Dispatch thread finished");
            })
    }
}
