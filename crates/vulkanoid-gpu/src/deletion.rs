//! Deferred teardown of GPU objects.
//!
//! GPU liveness cannot be inferred from CPU-side ownership: a buffer may be unreachable
//! from Rust while an in-flight command buffer still reads it. Teardown is therefore
//! registered explicitly, and only flushed once a fence (or a device-wide idle wait)
//! proves the GPU is done with everything in the queue.

use crate::error::{self, Result};

/// A boxed teardown action. Captured state must be owned (handles are `Copy`).
pub type Teardown = Box<dyn FnOnce() + Send + 'static>;

/// Ordered queue of teardown actions, flushed in reverse registration order.
///
/// Later-created objects may depend on earlier ones (a descriptor set on its pool, a
/// view on its image), so the most recently registered action always runs first.
#[derive(Default)]
pub struct DeletionQueue {
    actions: Vec<Teardown>,
}

impl DeletionQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a teardown action. Nothing runs until [`flush`](Self::flush).
    pub fn push<F>(&mut self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.actions.push(Box::new(action));
    }

    /// Register a release call that can fail.
    ///
    /// A failed release leaves driver state unknown, so the error is treated as fatal
    /// when the action eventually runs.
    pub fn push_fallible<F>(&mut self, label: &'static str, action: F)
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.push(move || {
            if let Err(err) = action() {
                error::fatal(label, &err);
            }
        });
    }

    /// Run every registered action, newest first, and empty the queue.
    ///
    /// Flushing an empty queue does nothing.
    ///
    /// The caller must guarantee the GPU no longer uses any resource in the queue.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn flush(&mut self) {
        if self.actions.is_empty() {
            return;
        }

        tracing::trace!(count = self.actions.len(), "flushing deletion queue");
        while let Some(action) = self.actions.pop() {
            action();
        }
    }

    /// Move all of `other`'s actions onto the end of this queue.
    ///
    /// The appended actions will run before the ones already held here.
    pub fn append(&mut self, other: &mut Self) {
        self.actions.append(&mut other.actions);
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no actions are pending.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl Drop for DeletionQueue {
    fn drop(&mut self) {
        // No fence proof exists here, so running the actions could free live GPU objects.
        if !self.actions.is_empty() {
            tracing::warn!(
                count = self.actions.len(),
                "deletion queue dropped without flush, leaking GPU objects"
            );
        }
    }
}

impl std::fmt::Debug for DeletionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionQueue")
            .field("pending", &self.actions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder() -> Arc<Mutex<Vec<&'static str>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn push_named(queue: &mut DeletionQueue, log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) {
        let log = log.clone();
        queue.push(move || log.lock().push(name));
    }

    #[test]
    fn flush_runs_newest_first() {
        let log = recorder();
        let mut queue = DeletionQueue::new();

        // Creation order: layout, pool, set.
        push_named(&mut queue, &log, "layout");
        push_named(&mut queue, &log, "pool");
        push_named(&mut queue, &log, "set");
        assert_eq!(queue.len(), 3);

        queue.flush();

        assert_eq!(*log.lock(), vec!["set", "pool", "layout"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn flush_of_empty_queue_is_noop() {
        let mut queue = DeletionQueue::new();
        queue.flush();
        queue.flush();
        assert!(queue.is_empty());
    }

    #[test]
    fn second_flush_does_not_rerun_actions() {
        let log = recorder();
        let mut queue = DeletionQueue::new();
        push_named(&mut queue, &log, "buffer");

        queue.flush();
        queue.flush();

        assert_eq!(*log.lock(), vec!["buffer"]);
    }

    #[test]
    fn actions_pushed_after_flush_run_on_next_flush() {
        let log = recorder();
        let mut queue = DeletionQueue::new();
        push_named(&mut queue, &log, "a");
        queue.flush();
        push_named(&mut queue, &log, "b");
        push_named(&mut queue, &log, "c");
        queue.flush();

        assert_eq!(*log.lock(), vec!["a", "c", "b"]);
    }

    #[test]
    fn appended_actions_run_before_existing_ones() {
        let log = recorder();
        let mut global = DeletionQueue::new();
        let mut scoped = DeletionQueue::new();
        push_named(&mut global, &log, "device-level");
        push_named(&mut scoped, &log, "scoped-1");
        push_named(&mut scoped, &log, "scoped-2");

        global.append(&mut scoped);
        assert!(scoped.is_empty());
        global.flush();

        assert_eq!(*log.lock(), vec!["scoped-2", "scoped-1", "device-level"]);
    }

    #[test]
    fn fallible_action_success_runs_normally() {
        let log = recorder();
        let mut queue = DeletionQueue::new();
        let inner = log.clone();
        queue.push_fallible("free allocation", move || {
            inner.lock().push("freed");
            Ok(())
        });

        queue.flush();
        assert_eq!(*log.lock(), vec!["freed"]);
    }
}
