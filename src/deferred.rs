//! `DeferredQueue`: a FIFO of (callback, [`SubmitToken`]) drained once the
//! GPU has retired the token, mirroring the source's pattern of deferring
//! Vulkan object destruction until the last command buffer that touched
//! them has been retired.

use crate::command::SubmitToken;

/// A closure to run once its [`SubmitToken`] is retired. Boxed because tasks
/// come from every resource kind (buffer/image/view/allocation teardown)
/// and have no common concrete type.
pub struct DeferredTask {
    callback: Box<dyn FnOnce() + Send>,
    token: SubmitToken,
}

impl std::fmt::Debug for DeferredTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredTask").field("token", &self.token).finish()
    }
}

/// FIFO of pending teardown callbacks. Monotonic ordering is guaranteed by
/// append order — nothing ever reorders or skips ahead.
#[derive(Default)]
pub struct DeferredQueue {
    tasks: std::collections::VecDeque<DeferredTask>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `callback`, due to run once `token` is retired.
    ///
    /// If `token` is the sentinel (0, "never submitted"), the caller should
    /// pass the queue's owner's `next_submit_token` instead, so the
    /// callback can't fire before the very next submit retires — see
    /// [`DeferredQueue::defer_with_fallback`].
    pub fn defer(&mut self, callback: impl FnOnce() + Send + 'static, token: SubmitToken) {
        self.tasks.push_back(DeferredTask { callback: Box::new(callback), token });
    }

    /// `defer`, but substituting `fallback_token` when `token` is the
    /// sentinel. `fallback_token` should be the owning `ImmediateCommands`'s
    /// `next_submit_token()` at call time.
    pub fn defer_with_fallback(
        &mut self,
        callback: impl FnOnce() + Send + 'static,
        token: SubmitToken,
        fallback_token: SubmitToken,
    ) {
        let token = if token.is_sentinel() { fallback_token } else { token };
        self.defer(callback, token);
    }

    /// Pop and run every task at the front of the queue whose token is
    /// reported retired by `retired_fn`, stopping at the first one that
    /// isn't. Runs callbacks synchronously on the calling thread.
    pub fn drain_ready(&mut self, mut retired_fn: impl FnMut(SubmitToken) -> bool) {
        while let Some(front) = self.tasks.front() {
            if !retired_fn(front.token) {
                break;
            }
            let task = self.tasks.pop_front().unwrap();
            (task.callback)();
        }
    }

    /// Run every remaining task, waiting on each one's token via `wait_fn`
    /// first. Used at manager teardown after a device-idle wait. Clears the
    /// queue unconditionally.
    pub fn drain_all(&mut self, mut wait_fn: impl FnMut(SubmitToken)) {
        while let Some(task) = self.tasks.pop_front() {
            wait_fn(task.token);
            (task.callback)();
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn drain_ready_runs_in_fifo_order_while_retired() {
        let mut queue = DeferredQueue::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..4u64 {
            let order = order.clone();
            queue.defer(move || order.lock().unwrap().push(i), SubmitToken::new(i + 1));
        }
        // Only tokens 1..=2 are retired.
        queue.drain_ready(|t| t.value() <= 2);
        assert_eq!(*order.lock().unwrap(), vec![0, 1]);
        assert_eq!(queue.len(), 2);

        queue.drain_ready(|t| t.value() <= 4);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_ready_stops_at_first_unretired() {
        let mut queue = DeferredQueue::new();
        let count = Arc::new(AtomicU32::new(0));
        for i in 1..=3u64 {
            let count = count.clone();
            queue.defer(move || { count.fetch_add(1, Ordering::SeqCst); }, SubmitToken::new(i));
        }
        // Token 2 never retires, so only task 1 runs even though 3 "would".
        queue.drain_ready(|t| t.value() == 1 || t.value() == 3);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn drain_all_waits_then_runs_every_task() {
        let mut queue = DeferredQueue::new();
        let waited = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 1..=3u64 {
            let waited = waited.clone();
            queue.defer(move || waited.lock().unwrap().push(i), SubmitToken::new(i));
        }
        let waited_on = Arc::new(std::sync::Mutex::new(Vec::new()));
        queue.drain_all(|t| waited_on.lock().unwrap().push(t.value()));
        assert_eq!(*waited_on.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*waited.lock().unwrap(), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn sentinel_token_falls_back_to_next_submit() {
        let mut queue = DeferredQueue::new();
        queue.defer_with_fallback(|| {}, SubmitToken::sentinel(), SubmitToken::new(7));
        queue.drain_ready(|t| {
            assert_eq!(t.value(), 7);
            false
        });
    }
}
