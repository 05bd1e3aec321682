use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinSet;

/// A cancellable scope for background tasks. Closing the group (or dropping
/// it) aborts everything still running, which is how an interface tears down
/// its subscriptions and how `Network::stop` winds the whole thing down.
pub struct TaskGroup {
    set: Mutex<JoinSet<()>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(JoinSet::new()),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.set.lock().expect("task group poisoned");
        // reap whatever already finished so the set doesn't grow unbounded
        while set.try_join_next().is_some() {}
        set.spawn(fut);
    }

    pub fn close(&self) {
        self.set.lock().expect("task group poisoned").abort_all();
    }

    pub fn len(&self) -> usize {
        self.set.lock().expect("task group poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskGroup {
    fn default() -> Self {
        Self::new()
    }
}
