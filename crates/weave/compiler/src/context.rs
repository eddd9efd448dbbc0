// Weave
// Copyright (C) 2025 Loomworks

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Serial execution contexts guarding shared mutable state.
//!
//! Each context is a dedicated worker thread draining a job queue, so jobs
//! on one context never overlap. Queue affinity is encoded in a token type:
//! state accessors require a token reference, and tokens are only handed to
//! jobs running on the owning context's thread.
//!
//! Two process-wide contexts exist: the environment context (scope lattice,
//! environments, dependency network, invalidated-module table) and the
//! code-generation context (the shared backend state, which is not
//! reentrant-safe). Each compiler additionally owns a delegate context for
//! its callback deliveries.

use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use std::thread::{self, ThreadId};
use tracing::debug;

/// Token types handed to jobs on a serial context. Not constructible
/// outside this module, and not sendable to other threads.
pub trait ContextToken: 'static {
    #[doc(hidden)]
    fn issue() -> Self;
}

/// Proof of running on the environment context.
pub struct EnvironmentToken {
    _not_send: PhantomData<*const ()>,
}

impl ContextToken for EnvironmentToken {
    fn issue() -> Self {
        Self { _not_send: PhantomData }
    }
}

/// Proof of running on the code-generation context.
pub struct CodegenToken {
    _not_send: PhantomData<*const ()>,
}

impl ContextToken for CodegenToken {
    fn issue() -> Self {
        Self { _not_send: PhantomData }
    }
}

/// Proof of running on a compiler's delegate context.
pub struct DelegateToken {
    _not_send: PhantomData<*const ()>,
}

impl ContextToken for DelegateToken {
    fn issue() -> Self {
        Self { _not_send: PhantomData }
    }
}

type Job<T> = Box<dyn FnOnce(&T) + Send>;

/// A single worker thread executing submitted jobs strictly in order.
pub struct SerialContext<T: ContextToken> {
    name: &'static str,
    // mpsc senders are Send but not Sync; the lock makes the context
    // shareable behind one Arc.
    sender: Mutex<Sender<Job<T>>>,
    worker: ThreadId,
}

impl<T: ContextToken> SerialContext<T> {
    pub fn new(name: &'static str) -> Arc<Self> {
        let (sender, receiver) = channel::<Job<T>>();
        let (id_sender, id_receiver) = channel();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                id_sender.send(thread::current().id()).ok();
                let token = T::issue();
                while let Ok(job) = receiver.recv() {
                    job(&token);
                }
                debug!(context = name, "serial context shut down");
            })
            .expect("spawning a serial context thread cannot fail");
        let worker = id_receiver.recv().expect("serial context thread reports its id");
        Arc::new(Self {
            name,
            sender: Mutex::new(sender),
            worker,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the calling thread is this context's worker.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.worker
    }

    /// Enqueues `job` and returns without waiting for it.
    pub fn run_async(&self, job: impl FnOnce(&T) + Send + 'static) {
        self.sender.lock().send(Box::new(job)).expect("serial context accepts jobs for the process lifetime");
    }

    /// Runs `job` on the context and blocks until it finishes. Safe to call
    /// from a job already on this context: the job then runs inline.
    pub fn run_sync<R: Send + 'static>(&self, job: impl FnOnce(&T) -> R + Send + 'static) -> R {
        if self.is_current() {
            // Already serialized by the worker thread.
            let token = T::issue();
            return job(&token);
        }
        let (sender, receiver) = channel();
        self.run_async(move |token| {
            sender.send(job(token)).ok();
        });
        receiver.recv().expect("serial context job completes")
    }
}

/// Counts outstanding units of asynchronous work and lets one thread block
/// until all of them finish. No busy polling.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

struct WaitGroupInner {
    count: Mutex<usize>,
    zero: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitGroupInner {
                count: Mutex::new(0),
                zero: Condvar::new(),
            }),
        }
    }

    pub fn add(&self, n: usize) {
        *self.inner.count.lock() += n;
    }

    pub fn done(&self) {
        let mut count = self.inner.count.lock();
        debug_assert!(*count > 0, "WaitGroup::done without matching add");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }

    /// Blocks until the count returns to zero. Returns immediately if no
    /// work is outstanding.
    pub fn wait(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.zero.wait(&mut count);
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let context: Arc<SerialContext<EnvironmentToken>> = SerialContext::new("test-env");
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            context.run_async(move |_| log.lock().push(i));
        }
        let log_clone = Arc::clone(&log);
        context.run_sync(move |_| drop(log_clone));
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_sync_reenters_inline() {
        let context: Arc<SerialContext<EnvironmentToken>> = SerialContext::new("test-env-reenter");
        let inner = Arc::clone(&context);
        let value = context.run_sync(move |_| inner.run_sync(|_| 42));
        assert_eq!(value, 42);
    }

    #[test]
    fn test_wait_group_blocks_until_done() {
        let group = WaitGroup::new();
        let counter = Arc::new(AtomicUsize::new(0));
        group.add(4);
        for _ in 0..4 {
            let group = group.clone();
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
                group.done();
            });
        }
        group.wait();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_wait_group_without_work_returns_immediately() {
        WaitGroup::new().wait();
    }
}
