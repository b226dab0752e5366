//! Deferred teardown for test scenarios.
//!
//! Scenarios register a delete action right after each successful create.
//! The runner drains the stack once the scenario body has returned, in
//! reverse registration order, whatever the body's result was.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::{debug, warn};

type Action = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Shared LIFO stack of async cleanup actions.
#[derive(Clone, Default)]
pub struct Cleanup {
    actions: Arc<Mutex<Vec<(String, Action)>>>,
}

impl Cleanup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `action` to run at teardown.
    pub fn defer<F, Fut>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Action = Box::new(move || Box::pin(action()));
        match self.actions.lock() {
            Ok(mut actions) => actions.push((label.into(), boxed)),
            Err(poisoned) => poisoned.into_inner().push((label.into(), boxed)),
        }
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.lock().map_or(0, |actions| actions.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<(String, Action)> {
        match self.actions.lock() {
            Ok(mut actions) => actions.pop(),
            Err(poisoned) => {
                warn!("Cleanup stack lock poisoned, continuing");
                poisoned.into_inner().pop()
            }
        }
    }

    /// Run every pending action, newest first.
    pub async fn run(&self) {
        while let Some((label, action)) = self.pop() {
            debug!(action = %label, "Running cleanup");
            action().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_in_reverse_order() {
        let cleanup = Cleanup::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            cleanup.defer(format!("step {i}"), move || async move {
                order.lock().unwrap().push(i);
            });
        }
        assert_eq!(cleanup.len(), 3);
        cleanup.run().await;
        assert!(cleanup.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_clones_share_the_stack() {
        let cleanup = Cleanup::new();
        let handle = cleanup.clone();
        handle.defer("noop", || async {});
        assert_eq!(cleanup.len(), 1);
        cleanup.run().await;
        assert!(handle.is_empty());
    }
}
