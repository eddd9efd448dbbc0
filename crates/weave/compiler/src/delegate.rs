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

//! Ordered, reference-counted, asynchronous delivery of "modules changed"
//! events to compiler delegates.
//!
//! Each delegate's callbacks run on its compiler's delegate context,
//! strictly serialized and in submission order: the next notification is
//! not delivered until the delegate acknowledges the previous one through
//! its [`CompletionToken`]. A [`LoadedModulesData`] may be retained by
//! several delegates at once; the modules it lists are freed when the last
//! retain is released.

use crate::context::{DelegateToken, SerialContext};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use tracing::debug;
use weave_common::IssueList;
use weave_core::Module;

/// A module replaced by a newer version: delegates see both.
#[derive(Debug, Clone)]
pub struct ModifiedModule {
    pub old: Arc<Module>,
    pub new: Arc<Module>,
}

/// One net change to the loaded-module set.
///
/// Holds the last strong references to the old versions of modified
/// modules and to removed modules; dropping the final clone of the `Arc`
/// wrapping this data is what actually frees them.
#[derive(Debug, Default)]
pub struct LoadedModulesData {
    pub added: BTreeMap<String, Arc<Module>>,
    pub modified: BTreeMap<String, ModifiedModule>,
    pub removed: BTreeMap<String, Arc<Module>>,
    pub issues: IssueList,
}

impl LoadedModulesData {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty() && self.issues.is_empty()
    }
}

/// Handed to the delegate with each notification; completing it (or
/// dropping it) acknowledges the notification and unblocks the next one.
pub struct CompletionToken {
    sender: Option<Sender<()>>,
}

impl CompletionToken {
    fn new(sender: Sender<()>) -> Self {
        Self { sender: Some(sender) }
    }

    pub fn complete(mut self) {
        if let Some(sender) = self.sender.take() {
            sender.send(()).ok();
        }
    }
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            sender.send(()).ok();
        }
    }
}

/// External listener notified of net changes to the loaded-module set.
pub trait CompilerDelegate: Send + Sync {
    /// Called with each change set. The data may be retained past the call
    /// by cloning the `Arc`; call `completion.complete()` (or drop it) when
    /// done so the next notification can be delivered.
    fn loaded_modules(&self, changes: &Arc<LoadedModulesData>, completion: CompletionToken);
}

/// Per-compiler notification queue: owns the delegate context and delivers
/// one notification at a time.
pub struct DelegateDispatcher {
    context: Arc<SerialContext<DelegateToken>>,
    delegate: Mutex<Option<Arc<dyn CompilerDelegate>>>,
}

impl DelegateDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            context: SerialContext::new("weave-delegate"),
            delegate: Mutex::new(None),
        })
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn CompilerDelegate>>) {
        *self.delegate.lock() = delegate;
    }

    pub fn has_delegate(&self) -> bool {
        self.delegate.lock().is_some()
    }

    /// Enqueues `changes` for delivery. The dispatcher retains the data
    /// until the delegate acknowledges it.
    pub fn notify(&self, changes: Arc<LoadedModulesData>) {
        let delegate = self.delegate.lock().clone();
        let Some(delegate) = delegate else {
            // No listener: the retain is released immediately and any
            // removed modules are freed here.
            return;
        };
        self.context.run_async(move |_| {
            let (sender, receiver) = channel();
            delegate.loaded_modules(&changes, CompletionToken::new(sender));
            // Strict ordering: hold this slot until acknowledged.
            receiver.recv().ok();
            debug!(
                added = changes.added.len(),
                modified = changes.modified.len(),
                removed = changes.removed.len(),
                "delegate acknowledged module changes"
            );
        });
    }

    /// Blocks until every notification enqueued so far has been delivered
    /// and acknowledged.
    pub fn drain(&self) {
        self.context.run_sync(|_| {});
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use weave_core::{Module, ModulePayload};

    struct RecordingDelegate {
        calls: Mutex<Vec<usize>>,
        in_flight: AtomicUsize,
        overlapped: AtomicUsize,
    }

    impl RecordingDelegate {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                overlapped: AtomicUsize::new(0),
            })
        }
    }

    impl CompilerDelegate for RecordingDelegate {
        fn loaded_modules(&self, changes: &Arc<LoadedModulesData>, completion: CompletionToken) {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.fetch_add(1, Ordering::SeqCst);
            }
            self.calls.lock().push(changes.added.len());
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            completion.complete();
        }
    }

    fn changes_with_added(n: usize) -> Arc<LoadedModulesData> {
        let mut added = BTreeMap::new();
        for i in 0..n {
            let key = format!("weave.test.m{i}");
            added.insert(key.clone(), Arc::new(Module::new(&key, ModulePayload::Library)));
        }
        Arc::new(LoadedModulesData {
            added,
            ..LoadedModulesData::default()
        })
    }

    #[test]
    fn test_notifications_are_ordered_and_non_overlapping() {
        let dispatcher = DelegateDispatcher::new();
        let delegate = RecordingDelegate::new();
        dispatcher.set_delegate(Some(delegate.clone()));
        for i in 1..=8 {
            dispatcher.notify(changes_with_added(i));
        }
        dispatcher.drain();
        assert_eq!(*delegate.calls.lock(), (1..=8).collect::<Vec<_>>());
        assert_eq!(delegate.overlapped.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_modules_freed_only_after_all_retains_released() {
        let module = Arc::new(Module::new("weave.test.gone", ModulePayload::Library));
        let weak = Arc::downgrade(&module);
        let data = Arc::new(LoadedModulesData {
            removed: BTreeMap::from([("weave.test.gone".to_string(), module)]),
            ..LoadedModulesData::default()
        });

        let first_retain = Arc::clone(&data);
        let second_retain = Arc::clone(&data);
        drop(data);
        drop(first_retain);
        assert!(weak.upgrade().is_some(), "a live retain keeps the removed module alive");
        drop(second_retain);
        assert!(weak.upgrade().is_none(), "last release frees the module");
    }

    #[test]
    fn test_dropping_token_acknowledges() {
        struct DroppingDelegate;
        impl CompilerDelegate for DroppingDelegate {
            fn loaded_modules(&self, _changes: &Arc<LoadedModulesData>, _completion: CompletionToken) {
                // Token dropped here without an explicit complete().
            }
        }
        let dispatcher = DelegateDispatcher::new();
        dispatcher.set_delegate(Some(Arc::new(DroppingDelegate)));
        dispatcher.notify(changes_with_added(1));
        dispatcher.drain();
    }
}
